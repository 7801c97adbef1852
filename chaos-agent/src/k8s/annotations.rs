//! Annotation and label keys read and written on pods and nodes,
//! centralized here instead of re-typed at every call site.

pub const INGRESS_CHAOS: &str = "kubernetes.io/ingress-chaos";
pub const EGRESS_CHAOS: &str = "kubernetes.io/egress-chaos";

pub const DONE_INGRESS_CHAOS: &str = "kubernetes.io/done-ingress-chaos";
pub const DONE_EGRESS_CHAOS: &str = "kubernetes.io/done-egress-chaos";

pub const CLEAR_INGRESS_CHAOS: &str = "kubernetes.io/clear-ingress-chaos";
pub const CLEAR_EGRESS_CHAOS: &str = "kubernetes.io/clear-egress-chaos";

/// Node-wide annotation requesting full teardown.
pub const CLEAR_CHAOS: &str = "kubernetes.io/clear-chaos";

pub const YES: &str = "yes";

pub const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
pub const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Desired state for one pod after parsing its annotations, per
/// `spec.md` §4.5(a).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodChaosInfo {
    pub ingress_spec: Option<String>,
    pub egress_spec: Option<String>,
    pub ingress_needs_update: bool,
    pub egress_needs_update: bool,
    pub ingress_needs_clear: bool,
    pub egress_needs_clear: bool,
}

/// Parses a pod's annotation map into the reconciler's desired-state view.
pub fn extract_pod_chaos_info(annotations: &std::collections::BTreeMap<String, String>) -> PodChaosInfo {
    let get = |key: &str| annotations.get(key).cloned();
    let is_done = |key: &str| annotations.get(key).map(String::as_str) == Some(YES);

    let ingress_spec = get(INGRESS_CHAOS);
    let egress_spec = get(EGRESS_CHAOS);

    PodChaosInfo {
        ingress_needs_update: ingress_spec.is_some() && !is_done(DONE_INGRESS_CHAOS),
        egress_needs_update: egress_spec.is_some() && !is_done(DONE_EGRESS_CHAOS),
        ingress_needs_clear: annotations.contains_key(CLEAR_INGRESS_CHAOS),
        egress_needs_clear: annotations.contains_key(CLEAR_EGRESS_CHAOS),
        ingress_spec,
        egress_spec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn needs_update_iff_present_and_not_done() {
        let annotations = map(&[(EGRESS_CHAOS, "100mbit,delay,100ms,10ms")]);
        let info = extract_pod_chaos_info(&annotations);
        assert!(info.egress_needs_update);
        assert!(!info.ingress_needs_update);
    }

    #[test]
    fn already_done_does_not_need_update() {
        let annotations = map(&[(EGRESS_CHAOS, "100mbit,delay,100ms,10ms"), (DONE_EGRESS_CHAOS, "yes")]);
        let info = extract_pod_chaos_info(&annotations);
        assert!(!info.egress_needs_update);
    }

    #[test]
    fn clear_flags_are_presence_based() {
        let annotations = map(&[(CLEAR_INGRESS_CHAOS, "")]);
        let info = extract_pod_chaos_info(&annotations);
        assert!(info.ingress_needs_clear);
        assert!(!info.egress_needs_clear);
    }
}
