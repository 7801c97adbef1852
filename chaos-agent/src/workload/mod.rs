//! Workload identity and the external workload-to-interface mapping
//! service, reached over an `etcdctl` child process against the node's
//! Calico workload-endpoint resource.

use chaos_tc::exec::Exec;
use k8s_openapi::api::core::v1::Node;

use crate::error::{AgentError, AgentResult};

/// Identity of a shaped workload: (namespace, node, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadId {
    pub namespace: String,
    pub node: String,
    pub name: String,
}

/// A workload's derived attributes for one tick: its host-side virtual
/// interface and its pod address in CIDR form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub id: WorkloadId,
    pub interface: String,
    pub cidr: String,
}

/// The narrow contract the reconciler needs from the workload-to-interface
/// mapping service. Kept as a trait (not a free function) so the
/// reconciler can be tested against a canned resolver without shelling
/// out, the same reason `chaos_tc::exec::Exec` is a trait.
pub trait InterfaceResolver {
    fn interface_for(&self, id: &WorkloadId) -> AgentResult<String>;
}

/// Doubles every hyphen in a pod name, matching the original's
/// `strings.Join(strings.Split(name, "-"), "--")` round trip.
fn double_hyphens(name: &str) -> String {
    name.split('-').collect::<Vec<_>>().join("--")
}

fn workload_endpoint_key(id: &WorkloadId) -> String {
    format!(
        "/calico/resources/v3/projectcalico.org/workloadendpoints/{}/{}-k8s-{}-eth0",
        id.namespace,
        id.node,
        double_hyphens(&id.name),
    )
}

#[derive(serde::Deserialize)]
struct WorkloadEndpointSpec {
    #[serde(rename = "interfaceName")]
    interface_name: String,
}

#[derive(serde::Deserialize)]
struct WorkloadEndpoint {
    spec: WorkloadEndpointSpec,
}

/// Resolves host interfaces by querying the Calico workload-endpoint
/// record in etcd through an `etcdctl get --prefix` child process.
pub struct EtcdctlResolver<'a> {
    exec: &'a dyn Exec,
    endpoint: String,
}

impl<'a> EtcdctlResolver<'a> {
    pub fn new(exec: &'a dyn Exec, endpoint: impl Into<String>) -> Self {
        EtcdctlResolver { exec, endpoint: endpoint.into() }
    }
}

impl InterfaceResolver for EtcdctlResolver<'_> {
    fn interface_for(&self, id: &WorkloadId) -> AgentResult<String> {
        let key = workload_endpoint_key(id);
        let endpoints_arg = format!("--endpoints={}", self.endpoint);

        let out = self.exec.run("etcdctl", &["get", &endpoints_arg, "--prefix", &key]);

        let resolution_failed = |reason: String| AgentError::InterfaceResolutionFailed {
            namespace: id.namespace.clone(),
            node: id.node.clone(),
            name: id.name.clone(),
            reason,
        };

        // etcdctl prints the key on the first line and the JSON value on
        // the second; only the second line is meaningful here.
        let value_line = out
            .output
            .split('\n')
            .nth(1)
            .ok_or_else(|| resolution_failed("etcdctl returned fewer than two lines".to_string()))?;

        let workload: WorkloadEndpoint =
            serde_json::from_str(value_line).map_err(|err| resolution_failed(format!("json parse error: {err}")))?;

        Ok(workload.spec.interface_name)
    }
}

/// `GetMasterIP`-equivalent: the control-plane node's first `InternalIP`,
/// used as the default `--etcd-endpoint` host when the flag is unset.
pub fn default_etcd_endpoint(nodes: &[Node]) -> AgentResult<String> {
    let control_plane = nodes
        .iter()
        .find(|node| {
            node.metadata
                .labels
                .as_ref()
                .is_some_and(|labels| {
                    labels.contains_key(crate::k8s::annotations::MASTER_ROLE_LABEL)
                        || labels.contains_key(crate::k8s::annotations::CONTROL_PLANE_ROLE_LABEL)
                })
        })
        .ok_or(AgentError::NoControlPlaneNode)?;

    let internal_ip = control_plane
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| addresses.iter().find(|addr| addr.type_ == "InternalIP"))
        .ok_or(AgentError::NoControlPlaneNode)?;

    Ok(format!("{}:6666", internal_ip.address))
}

#[cfg(test)]
mod tests {
    use chaos_tc::exec::{ExecOutput, MockExec};
    use mockall::predicate::*;

    use super::*;

    #[test]
    fn doubles_hyphens_in_pod_name() {
        assert_eq!(double_hyphens("my-pod-name"), "my--pod--name");
    }

    #[test]
    fn builds_expected_etcd_key() {
        let id = WorkloadId { namespace: "default".into(), node: "node-1".into(), name: "my-pod".into() };
        assert_eq!(
            workload_endpoint_key(&id),
            "/calico/resources/v3/projectcalico.org/workloadendpoints/default/node-1-k8s-my--pod-eth0"
        );
    }

    #[test]
    fn resolves_interface_name_from_second_line() {
        let mut mock = MockExec::new();
        mock.expect_run().with(eq("etcdctl"), always()).returning(|_, _| ExecOutput {
            output: "/calico/resources/v3/.../my--pod-eth0\n{\"spec\":{\"interfaceName\":\"cali1234abcd\"}}\n".to_string(),
            status: 0,
        });

        let resolver = EtcdctlResolver::new(&mock, "10.0.0.1:6666");
        let id = WorkloadId { namespace: "default".into(), node: "node-1".into(), name: "my-pod".into() };
        assert_eq!(resolver.interface_for(&id).unwrap(), "cali1234abcd");
    }

    #[test]
    fn missing_second_line_is_resolution_failure() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| ExecOutput { output: "".to_string(), status: 0 });

        let resolver = EtcdctlResolver::new(&mock, "10.0.0.1:6666");
        let id = WorkloadId { namespace: "default".into(), node: "node-1".into(), name: "my-pod".into() };
        assert!(matches!(resolver.interface_for(&id), Err(AgentError::InterfaceResolutionFailed { .. })));
    }
}
