//! [`ClusterApi`] backed by a kube-rs client

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, instrument};

use super::{ClusterApi, ControllerKind, NodeInfo, OwnerRef, PodInfo};
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "node-rotator";

/// Production cluster access. Owns the client for the duration of a run.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration, falling back to kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<NodeInfo>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = nodes.list(&params).await?;
        Ok(list.items.iter().map(NodeInfo::from).collect())
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(name).await?;
        Ok(NodeInfo::from(&node))
    }

    #[instrument(skip(self))]
    async fn cordon_node(&self, name: &str, resource_version: Option<&str>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        // A resourceVersion in a merge patch turns it into a conditional update.
        let patch = match resource_version {
            Some(rv) => json!({
                "metadata": { "resourceVersion": rv },
                "spec": { "unschedulable": true }
            }),
            None => json!({ "spec": { "unschedulable": true } }),
        };
        nodes
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods(&self, field_selector: Option<&str>) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = field_selector {
            params = params.fields(selector);
        }
        let list = pods.list(&params).await?;
        Ok(list.items.iter().map(PodInfo::from).collect())
    }

    async fn list_namespaced_pods(&self, namespace: &str) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(PodInfo::from).collect())
    }

    async fn get_owner(
        &self,
        namespace: &str,
        kind: &ControllerKind,
        name: &str,
    ) -> Result<Option<OwnerRef>> {
        let owners = match kind {
            ControllerKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                api.get(name).await?.owner_references().to_vec()
            }
            ControllerKind::Job => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                api.get(name).await?.owner_references().to_vec()
            }
            _ => return Ok(None),
        };
        Ok(controlling_owner(&owners))
    }

    #[instrument(skip(self))]
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Option<u32>,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: grace_period.map(|secs| DeleteParams {
                grace_period_seconds: Some(secs),
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };
        match pods.evict(name, &params).await {
            Ok(_) => {
                debug!("Eviction created for pod {}/{}", namespace, name);
                Ok(())
            }
            // 429 is how the API refuses an eviction that would violate a
            // PodDisruptionBudget; a misconfigured budget surfaces as 500.
            Err(kube::Error::Api(resp)) if resp.code == 429 || resp.code == 500 => {
                Err(Error::EvictionBlocked {
                    pod: format!("{namespace}/{name}"),
                    reason: resp.message,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn controlling_owner(owners: &[OwnerReference]) -> Option<OwnerRef> {
    owners
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| OwnerRef::new(ControllerKind::parse(&o.kind), o.name.clone()))
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "True");
        NodeInfo {
            name: node.name_any(),
            labels: node.labels().clone(),
            created: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
            ready,
            resource_version: node.resource_version(),
        }
    }
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "True");
        PodInfo {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            labels: pod.labels().clone(),
            annotations: pod.annotations().clone(),
            owner: controlling_owner(pod.owner_references()),
            phase: status.and_then(|s| s.phase.clone()),
            ready,
            terminating: pod.metadata.deletion_timestamp.is_some(),
        }
    }
}
