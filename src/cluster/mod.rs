//! Cluster access for the rotation engine
//!
//! [`ClusterApi`] is the only path to the Kubernetes API. The production
//! implementation is [`KubeCluster`]; everything above it works on the plain
//! [`NodeInfo`] / [`PodInfo`] snapshots defined here.

mod kube_cluster;
pub mod owner;
pub mod reader;
#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

pub use kube_cluster::KubeCluster;
pub use owner::{resolve_controller, ControllerKey, ControllerKind, OwnerRef};
pub use reader::{ClusterStateReader, ReplicaMap, ReplicaPlacement};

/// Annotation the kubelet puts on static (mirror) pods
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Point-in-time view of a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub created: Option<DateTime<Utc>>,
    pub unschedulable: bool,
    pub ready: bool,
    pub resource_version: Option<String>,
}

impl NodeInfo {
    /// Age of the node at `now`; nodes without a creation timestamp count as new.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.created
            .map(|created| now - created)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

/// Point-in-time view of a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Controlling owner reference, if any
    pub owner: Option<OwnerRef>,
    pub phase: Option<String>,
    pub ready: bool,
    pub terminating: bool,
}

impl PodInfo {
    /// Running, Ready and not on its way out.
    pub fn is_ready(&self) -> bool {
        self.phase.as_deref() == Some("Running") && self.ready && !self.terminating
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.phase.as_deref(), Some("Succeeded") | Some("Failed"))
    }

    pub fn is_daemonset_pod(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.kind == ControllerKind::DaemonSet)
    }

    pub fn is_mirror_pod(&self) -> bool {
        self.annotations.contains_key(MIRROR_POD_ANNOTATION)
    }

    pub fn matches_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(String::as_str) == Some(value)
    }
}

impl fmt::Display for PodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Operations the rotation engine needs from the Kubernetes API.
///
/// Implementations must map failures onto the crate [`Error`](crate::Error)
/// kinds: `NotFound`, `Conflict`, `Forbidden`, `ApiUnavailable`, and
/// `EvictionBlocked` for rejected evictions.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List nodes, optionally filtered by a label selector.
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<NodeInfo>>;

    async fn get_node(&self, name: &str) -> Result<NodeInfo>;

    /// Mark a node unschedulable, failing with `Conflict` if
    /// `resource_version` is stale.
    async fn cordon_node(&self, name: &str, resource_version: Option<&str>) -> Result<()>;

    /// List pods across all namespaces, optionally by field selector.
    async fn list_pods(&self, field_selector: Option<&str>) -> Result<Vec<PodInfo>>;

    async fn list_namespaced_pods(&self, namespace: &str) -> Result<Vec<PodInfo>>;

    /// Controlling owner of a workload object, `None` at the top of the chain.
    async fn get_owner(
        &self,
        namespace: &str,
        kind: &ControllerKind,
        name: &str,
    ) -> Result<Option<OwnerRef>>;

    /// Create an eviction for a pod through the eviction subresource.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Option<u32>,
    ) -> Result<()>;
}

/// Field selector for pods bound to `node_name`
pub fn pods_on_node_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

pub const PENDING_PODS_SELECTOR: &str = "status.phase=Pending";
