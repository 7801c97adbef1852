//! The fleet reconciler: one tick over the local node's eligible
//! workloads, per `spec.md` §4.5.

use std::collections::{BTreeMap, HashSet};

use chaos_tc::{exec::Exec, mirror::MirrorDevices, shaper, Direction, ParsedImpairment, Shaper};
use tracing::{error, info, instrument, warn};

use crate::{
    error::AgentResult,
    k8s::{annotations, KubeClient},
    workload::{InterfaceResolver, WorkloadId},
};

/// What the caller should do after a tick: keep polling normally, or stop
/// reconciling and idle forever because a node-wide clear just ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    NodeCleared,
}

/// One tick of the reconcile loop.
#[instrument(skip_all, fields(node = %node_name, selector = %label_selector), err)]
pub async fn tick(
    kube: &KubeClient,
    exec: &dyn Exec,
    resolver: &dyn InterfaceResolver,
    mirrors: &MirrorDevices,
    node_name: &str,
    label_selector: &str,
) -> AgentResult<Outcome> {
    let node = kube.get_node(node_name).await?;

    let node_clear_requested = node
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(annotations::CLEAR_CHAOS));

    if node_clear_requested {
        node_clear(kube, exec, resolver, mirrors, node_name, label_selector).await?;
        return Ok(Outcome::NodeCleared);
    }

    let pods = kube.list_pods_on_node(label_selector, node_name).await?;

    let mut ingress_keep = HashSet::new();
    let mut egress_keep = HashSet::new();

    for pod in &pods {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());

        let Some(pod_ip) = pod_ip else {
            warn!(namespace, name, "pod has no assigned ip yet, skipping");
            continue;
        };
        let cidr = format!("{pod_ip}/32");

        let annotations_map: BTreeMap<String, String> = pod
            .metadata
            .annotations
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        let info = annotations::extract_pod_chaos_info(&annotations_map);

        // Recorded unconditionally so already-applied cidrs are never
        // garbage-collected.
        egress_keep.insert(cidr.clone());
        ingress_keep.insert(cidr.clone());

        if !info.ingress_needs_update && !info.egress_needs_update {
            continue;
        }

        let id = WorkloadId { namespace: namespace.clone(), node: node_name.to_string(), name: name.clone() };
        let interface = match resolver.interface_for(&id) {
            Ok(interface) => interface,
            Err(err) => {
                error!(namespace, name, %err, "failed to resolve host interface, skipping pod this tick");
                continue;
            }
        };

        let mut shaper = Shaper::new(interface.clone(), mirrors.a, mirrors.b);
        let mut writeback: BTreeMap<String, Option<String>> = BTreeMap::new();

        if info.ingress_needs_update {
            if info.ingress_needs_clear {
                clear_direction(exec, mirrors, &interface, Direction::Ingress, &cidr, &namespace, &name);
                writeback.extend(clear_writeback(annotations::INGRESS_CHAOS, annotations::CLEAR_INGRESS_CHAOS, annotations::DONE_INGRESS_CHAOS));
            } else if let Err(err) = apply_direction(exec, &mut shaper, Direction::Ingress, &cidr, info.ingress_spec.as_deref().unwrap_or("")) {
                error!(namespace, name, %err, direction = "ingress", "failed to apply chaos");
            } else {
                writeback.insert(annotations::DONE_INGRESS_CHAOS.to_string(), Some(annotations::YES.to_string()));
            }
        }

        if info.egress_needs_update {
            if info.egress_needs_clear {
                clear_direction(exec, mirrors, &interface, Direction::Egress, &cidr, &namespace, &name);
                writeback.extend(clear_writeback(annotations::EGRESS_CHAOS, annotations::CLEAR_EGRESS_CHAOS, annotations::DONE_EGRESS_CHAOS));
            } else if let Err(err) = apply_direction(exec, &mut shaper, Direction::Egress, &cidr, info.egress_spec.as_deref().unwrap_or("")) {
                error!(namespace, name, %err, direction = "egress", "failed to apply chaos");
            } else {
                writeback.insert(annotations::DONE_EGRESS_CHAOS.to_string(), Some(annotations::YES.to_string()));
            }
        }

        if !writeback.is_empty() {
            if let Err(err) = kube.patch_pod_annotations(&namespace, &name, writeback).await {
                error!(namespace, name, %err, "failed to write back pod annotations");
            }
        }
    }

    garbage_collect(exec, mirrors, &ingress_keep, &egress_keep);

    Ok(Outcome::Continue)
}

fn apply_direction(exec: &dyn Exec, shaper: &mut Shaper, direction: Direction, cidr: &str, raw_spec: &str) -> chaos_tc::TcResult<()> {
    let impairment = ParsedImpairment::parse(raw_spec)?;

    shaper.reconcile_mirroring(exec, direction, cidr)?;
    shaper.clear_interface(exec, direction);
    shaper.reconcile_interface(exec, direction)?;
    shaper.reconcile_cidr(direction, cidr, &impairment);
    shaper.exec_tc_chaos(exec, direction, &impairment)?;

    Ok(())
}

fn clear_direction(exec: &dyn Exec, mirrors: &MirrorDevices, interface: &str, direction: Direction, cidr: &str, namespace: &str, name: &str) {
    Shaper::clear_mirroring(exec, interface, direction);

    let mirror = match direction {
        Direction::Egress => mirrors.a,
        Direction::Ingress => mirrors.b,
    };

    if let Err(err) = shaper::reset(exec, cidr, &mirror.name()) {
        warn!(namespace, name, %err, ?direction, "reset during clear found nothing to remove");
    }
}

fn clear_writeback(spec_key: &str, clear_key: &str, done_key: &str) -> BTreeMap<String, Option<String>> {
    [(spec_key.to_string(), None), (clear_key.to_string(), None), (done_key.to_string(), None)]
        .into_iter()
        .collect()
}

fn garbage_collect(exec: &dyn Exec, mirrors: &MirrorDevices, ingress_keep: &HashSet<String>, egress_keep: &HashSet<String>) {
    for (mirror, keep) in [(mirrors.a, egress_keep), (mirrors.b, ingress_keep)] {
        let name = mirror.name();
        let live = match shaper::list_cidrs(exec, &name) {
            Ok(live) => live,
            Err(err) => {
                error!(mirror = %name, %err, "failed to list live cidrs for garbage collection");
                continue;
            }
        };

        for cidr in live {
            if !keep.contains(&cidr) {
                info!(mirror = %name, cidr, "garbage collecting stale class");
                if let Err(err) = shaper::reset(exec, &cidr, &name) {
                    error!(mirror = %name, cidr, %err, "failed to garbage collect stale class");
                }
            }
        }
    }
}

/// Node-wide clear: tears down both mirror devices and every pod's
/// mirroring, then removes the node's clear flag and selector label so
/// the external orchestrator stops scheduling the agent here.
async fn node_clear(
    kube: &KubeClient,
    exec: &dyn Exec,
    resolver: &dyn InterfaceResolver,
    mirrors: &MirrorDevices,
    node_name: &str,
    label_selector: &str,
) -> AgentResult<()> {
    info!(node = node_name, "node-wide clear-chaos requested, tearing down");

    if let Err(err) = mirrors.teardown(exec) {
        warn!(%err, "mirror device teardown incomplete during node clear");
    }

    if let Ok(pods) = kube.list_pods_on_node(label_selector, node_name).await {
        for pod in pods {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let name = pod.metadata.name.clone().unwrap_or_default();
            let id = WorkloadId { namespace: namespace.clone(), node: node_name.to_string(), name: name.clone() };

            let Ok(interface) = resolver.interface_for(&id) else {
                warn!(namespace, name, "could not resolve interface during node clear, skipping");
                continue;
            };

            Shaper::clear_mirroring(exec, &interface, Direction::Ingress);
            Shaper::clear_mirroring(exec, &interface, Direction::Egress);

            let writeback: BTreeMap<String, Option<String>> = [
                clear_writeback(annotations::INGRESS_CHAOS, annotations::CLEAR_INGRESS_CHAOS, annotations::DONE_INGRESS_CHAOS),
                clear_writeback(annotations::EGRESS_CHAOS, annotations::CLEAR_EGRESS_CHAOS, annotations::DONE_EGRESS_CHAOS),
            ]
            .into_iter()
            .flatten()
            .collect();

            if let Err(err) = kube.patch_pod_annotations(&namespace, &name, writeback).await {
                error!(namespace, name, %err, "failed to clear pod annotations during node clear");
            }
        }
    }

    let selector_label_key = label_selector.split('=').next().unwrap_or(label_selector);
    if let Err(err) = kube.clear_node_chaos_flag(node_name, selector_label_key).await {
        error!(%err, "failed to clear node's chaos flag and selector label");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_writeback_nulls_the_whole_triplet() {
        let writeback = clear_writeback(annotations::EGRESS_CHAOS, annotations::CLEAR_EGRESS_CHAOS, annotations::DONE_EGRESS_CHAOS);

        assert_eq!(writeback.len(), 3);
        assert_eq!(writeback.get(annotations::EGRESS_CHAOS), Some(&None));
        assert_eq!(writeback.get(annotations::CLEAR_EGRESS_CHAOS), Some(&None));
        assert_eq!(writeback.get(annotations::DONE_EGRESS_CHAOS), Some(&None));
    }
}
