use std::time::Duration;

use clap::Parser;

/// CLI surface for the chaos agent, `spec.md` §6. Every flag doubles as an
/// environment variable of the same name for container deployments.
#[derive(Debug, Clone, Parser)]
#[command(name = "chaos-agent", about = "Per-node kernel traffic-control chaos injection agent")]
pub struct Args {
    /// Path to the kubeconfig used to reach the platform API.
    #[arg(long, env = "KUBECONFIG", default_value = "/etc/kubernetes/kubelet.conf")]
    pub kubeconfig: String,

    /// Endpoint of the workload-to-interface mapping service. Defaults to
    /// the control-plane node's internal IP on port 6666 when unset.
    #[arg(long, env = "ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    /// Label selector identifying pods to shape.
    #[arg(long, env = "LABEL_SELECTOR", default_value = "chaos=on")]
    pub label_selector: String,

    /// Id of the mirror device absorbing shaped workloads' egress traffic.
    #[arg(long, env = "FIRST_IFB", default_value_t = 0)]
    pub first_ifb: u8,

    /// Id of the mirror device absorbing shaped workloads' ingress traffic.
    #[arg(long, env = "SECOND_IFB", default_value_t = 1)]
    pub second_ifb: u8,

    /// Tick interval in seconds.
    #[arg(long, env = "SYNC_DURATION", default_value_t = 1)]
    pub sync_duration: u64,

    /// Increase log verbosity (can be repeated). Overridden by `RUST_LOG`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Name of this node, used to scope the pod and node lookups. Normally
    /// injected by the DaemonSet's downward API.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,
}

impl Args {
    pub fn sync_duration(&self) -> Duration {
        Duration::from_secs(self.sync_duration)
    }

    pub fn default_log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "chaos_agent=info,chaos_tc=info",
            1 => "chaos_agent=debug,chaos_tc=debug",
            _ => "trace",
        }
    }
}
