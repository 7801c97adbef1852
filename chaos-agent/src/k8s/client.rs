use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde_json::json;
use tracing::instrument;

use super::annotations;
use crate::error::{AgentError, AgentResult};

/// Thin wrapper around a `kube::Client`, narrowed to exactly the
/// list-pods/list-nodes/patch-annotations contract the reconciler needs.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    #[instrument(skip_all, fields(path = kubeconfig_path), err)]
    pub async fn try_new(kubeconfig_path: &str) -> AgentResult<Self> {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path).map_err(|source| AgentError::KubeconfigError {
            path: kubeconfig_path.to_string(),
            source,
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|source| AgentError::KubeconfigError { path: kubeconfig_path.to_string(), source })?;
        let client = Client::try_from(config).map_err(AgentError::ClientError)?;

        Ok(KubeClient { client })
    }

    pub async fn get_node(&self, name: &str) -> AgentResult<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    /// Used to derive the default etcd endpoint from the control-plane
    /// node's internal IP.
    pub async fn list_nodes(&self) -> AgentResult<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn list_pods_on_node(&self, selector: &str, node_name: &str) -> AgentResult<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let field_selector = format!("spec.nodeName={node_name}");
        let params = ListParams::default().labels(selector).fields(&field_selector);

        Ok(api.list(&params).await?.items)
    }

    pub async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        changes: BTreeMap<String, Option<String>>,
    ) -> AgentResult<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "annotations": changes } });

        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    /// Deletes the node's clear-chaos annotation and the given selector
    /// label key, so the external orchestrator stops scheduling the agent
    /// here.
    pub async fn clear_node_chaos_flag(&self, name: &str, selector_label_key: &str) -> AgentResult<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "annotations": { (annotations::CLEAR_CHAOS): serde_json::Value::Null },
                "labels": { (selector_label_key): serde_json::Value::Null },
            }
        });

        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}
