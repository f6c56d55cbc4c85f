//! Cluster State Reader
//!
//! Read-only view of managed nodes and per-controller replica placement.
//! Every call goes back to the API server; nothing here is cached between
//! calls, so a [`ReplicaMap`] always reflects the cluster at build time.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::{
    owner::resolve_controller, pods_on_node_selector, ClusterApi, ControllerKey, NodeInfo,
    OwnerRef, PodInfo, PENDING_PODS_SELECTOR,
};
use crate::error::Result;

/// Where one replica of a controller currently runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicaPlacement {
    pub pod: String,
    pub node: Option<String>,
    pub ready: bool,
}

/// Controller identity → every replica currently scheduled for it
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplicaMap {
    controllers: BTreeMap<ControllerKey, Vec<ReplicaPlacement>>,
}

impl ReplicaMap {
    pub fn insert(&mut self, key: ControllerKey, placement: ReplicaPlacement) {
        let replicas = self.controllers.entry(key).or_default();
        replicas.push(placement);
        replicas.sort_by(|a, b| a.pod.cmp(&b.pod));
    }

    pub fn replicas(&self, key: &ControllerKey) -> &[ReplicaPlacement] {
        self.controllers.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ready_count(&self, key: &ControllerKey) -> usize {
        self.replicas(key).iter().filter(|r| r.ready).count()
    }

    pub fn ready_on_node(&self, key: &ControllerKey, node: &str) -> usize {
        self.replicas(key)
            .iter()
            .filter(|r| r.ready && r.node.as_deref() == Some(node))
            .count()
    }

    /// Controllers with at least one replica scheduled on `node`
    pub fn controllers_on_node<'a>(
        &'a self,
        node: &'a str,
    ) -> impl Iterator<Item = &'a ControllerKey> + 'a {
        self.controllers.iter().filter_map(move |(key, replicas)| {
            replicas
                .iter()
                .any(|r| r.node.as_deref() == Some(node))
                .then_some(key)
        })
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ControllerKey> {
        self.controllers.keys()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

pub struct ClusterStateReader<'a, C: ClusterApi + ?Sized> {
    cluster: &'a C,
    managed_node_selector: String,
}

impl<'a, C: ClusterApi + ?Sized> ClusterStateReader<'a, C> {
    pub fn new(cluster: &'a C, managed_node_selector: impl Into<String>) -> Self {
        Self {
            cluster,
            managed_node_selector: managed_node_selector.into(),
        }
    }

    /// Nodes matching the managed-node selector, sorted by name.
    #[instrument(skip(self), fields(selector = %self.managed_node_selector))]
    pub async fn list_managed_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes = self
            .cluster
            .list_nodes(Some(&self.managed_node_selector))
            .await?;
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let now = Utc::now();
        for node in &nodes {
            debug!(
                "Managed node {} is {} days old",
                node.name,
                node.age(now).num_days()
            );
        }
        info!("Found {} managed nodes", nodes.len());
        Ok(nodes)
    }

    /// Every node in the cluster, regardless of selector.
    pub async fn list_all_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.cluster.list_nodes(None).await
    }

    pub async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        self.cluster.get_node(name).await
    }

    /// Group every replica of every controller that has a pod on `nodes`.
    ///
    /// Replicas are collected cluster-wide so that ready copies running
    /// outside the managed node set are counted.
    #[instrument(skip(self, nodes), fields(nodes = nodes.len()))]
    pub async fn build_replica_map(&self, nodes: &[NodeInfo]) -> Result<ReplicaMap> {
        let node_names: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let pods = self.cluster.list_pods(None).await?;

        let mut resolver = OwnerCache::default();
        let mut resolved = Vec::with_capacity(pods.len());
        let mut relevant = HashSet::new();
        for pod in &pods {
            let Some(key) = resolver.resolve(self.cluster, pod).await? else {
                continue;
            };
            if pod
                .node_name
                .as_deref()
                .is_some_and(|n| node_names.contains(n))
            {
                relevant.insert(key.clone());
            }
            resolved.push((key, pod));
        }

        let mut map = ReplicaMap::default();
        for (key, pod) in resolved {
            if relevant.contains(&key) {
                map.insert(key, placement(pod));
            }
        }
        debug!("Replica map covers {} controllers", map.len());
        Ok(map)
    }

    /// Fresh placement of a single controller's replicas.
    pub async fn controller_replicas(&self, key: &ControllerKey) -> Result<Vec<ReplicaPlacement>> {
        let pods = self.cluster.list_namespaced_pods(&key.namespace).await?;
        let mut resolver = OwnerCache::default();
        let mut replicas = Vec::new();
        for pod in &pods {
            if resolver.resolve(self.cluster, pod).await?.as_ref() == Some(key) {
                replicas.push(placement(pod));
            }
        }
        replicas.sort_by(|a, b| a.pod.cmp(&b.pod));
        Ok(replicas)
    }

    pub async fn pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>> {
        let mut pods = self
            .cluster
            .list_pods(Some(&pods_on_node_selector(node)))
            .await?;
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(pods)
    }

    /// Pods of `key` currently on `node`, resolved fresh.
    pub async fn controller_pods_on_node(
        &self,
        key: &ControllerKey,
        node: &str,
    ) -> Result<Vec<PodInfo>> {
        let mut resolver = OwnerCache::default();
        let mut pods = Vec::new();
        for pod in self.pods_on_node(node).await? {
            if pod.namespace == key.namespace
                && resolver.resolve(self.cluster, &pod).await?.as_ref() == Some(key)
            {
                pods.push(pod);
            }
        }
        Ok(pods)
    }

    pub async fn pending_pods(&self) -> Result<Vec<PodInfo>> {
        self.cluster.list_pods(Some(PENDING_PODS_SELECTOR)).await
    }

    /// Node hosting the first Running pod whose name contains `fragment`.
    pub async fn node_of_running_pod(&self, fragment: &str) -> Result<Option<String>> {
        let pods = self.cluster.list_pods(None).await?;
        Ok(pods
            .into_iter()
            .filter(|p| p.name.contains(fragment) && p.phase.as_deref() == Some("Running"))
            .find_map(|p| p.node_name))
    }
}

fn placement(pod: &PodInfo) -> ReplicaPlacement {
    ReplicaPlacement {
        pod: pod.name.clone(),
        node: pod.node_name.clone(),
        ready: pod.is_ready(),
    }
}

/// Memoises owner lookups for the lifetime of one read, so sibling pods of
/// the same ReplicaSet cost a single API call.
#[derive(Default)]
struct OwnerCache {
    resolved: HashMap<(String, OwnerRef), Option<ControllerKey>>,
}

impl OwnerCache {
    async fn resolve<C: ClusterApi + ?Sized>(
        &mut self,
        cluster: &C,
        pod: &PodInfo,
    ) -> Result<Option<ControllerKey>> {
        let Some(owner) = pod.owner.clone() else {
            return Ok(None);
        };
        let cache_key = (pod.namespace.clone(), owner);
        if let Some(hit) = self.resolved.get(&cache_key) {
            return Ok(hit.clone());
        }
        let key = resolve_controller(cluster, pod).await?;
        self.resolved.insert(cache_key, key.clone());
        Ok(key)
    }
}
