mod config;
mod error;
mod k8s;
mod reconcile;
mod workload;

use chaos_tc::{mirror::MirrorDevices, RealExec};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{config::Args, error::AgentResult, k8s::KubeClient, workload::EtcdctlResolver};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_tracing(&args);

    if let Err(err) = run(args).await {
        error!(%err, "chaos-agent exiting on fatal error");
        std::process::exit(1);
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.default_log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> AgentResult<()> {
    let exec = RealExec;
    let mirrors = MirrorDevices::new(args.first_ifb, args.second_ifb);
    mirrors.init(&exec)?;
    info!(first = args.first_ifb, second = args.second_ifb, "mirror devices initialized");

    let kube = KubeClient::try_new(&args.kubeconfig).await?;

    let etcd_endpoint = match &args.etcd_endpoint {
        Some(endpoint) => endpoint.clone(),
        None => {
            let nodes = kube.list_nodes().await?;
            workload::default_etcd_endpoint(&nodes)?
        }
    };
    info!(etcd_endpoint, "resolved workload mapping service endpoint");

    let resolver = EtcdctlResolver::new(&exec, etcd_endpoint);

    loop {
        match reconcile::tick(&kube, &exec, &resolver, &mirrors, &args.node_name, &args.label_selector).await {
            Ok(reconcile::Outcome::Continue) => {}
            Ok(reconcile::Outcome::NodeCleared) => {
                info!("node-wide clear complete, idling until the orchestrator removes this agent");
                loop {
                    tokio::time::sleep(args.sync_duration()).await;
                }
            }
            Err(err) => warn!(%err, "reconcile tick failed, will retry next tick"),
        }

        tokio::time::sleep(args.sync_duration()).await;
    }
}
