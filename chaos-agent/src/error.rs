use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

/// Error kinds produced above the kernel-reconciliation layer. Mirrors
/// `chaos_tc::TcError` for the kernel side and adds the two process-fatal
/// boot paths plus the platform-API errors the reconcile loop catches and
/// logs rather than propagates.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tc(#[from] chaos_tc::TcError),

    #[error("failed to load kubeconfig from {path}: {source}")]
    KubeconfigError {
        path: String,
        #[source]
        source: kube::config::KubeconfigError,
    },

    #[error("failed to construct platform client: {0}")]
    ClientError(#[source] kube::Error),

    #[error("platform API call failed: {0}")]
    KubeApiError(#[from] kube::Error),

    #[error("workload mapping lookup failed for {namespace}/{name} on {node}: {reason}")]
    InterfaceResolutionFailed {
        namespace: String,
        node: String,
        name: String,
        reason: String,
    },

    #[error("no control-plane node found to derive a default etcd endpoint")]
    NoControlPlaneNode,
}
