//! In-memory [`ClusterApi`] used by the unit tests.
//!
//! Evicted pods of a controller are replaced on the first schedulable node
//! other than their source, the way a ReplicaSet or StatefulSet controller
//! would recreate them. Knobs exist for stuck pods, PDB-blocked evictions,
//! replacements that never become ready, conflicts and API outages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{ClusterApi, ControllerKind, NodeInfo, OwnerRef, PodInfo, MIRROR_POD_ANNOTATION};
use crate::config::DEFAULT_MANAGED_NODE_SELECTOR;
use crate::error::{Error, Result};

pub const NAMESPACE: &str = "default";

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, NodeInfo>,
    pods: BTreeMap<(String, String), PodInfo>,
    owners: HashMap<(String, String), OwnerRef>,
    blocked: HashSet<String>,
    stuck: HashSet<String>,
    vanished: HashSet<String>,
    /// Polls left before a replacement pod turns ready; `None` never
    replacement_ready_after: Option<u32>,
    countdowns: HashMap<(String, String), u32>,
    provision_on_eviction: Vec<NodeInfo>,
    unavailable: bool,
    outage_after_cordon: bool,
    conflicts: u32,
    evictions: Vec<String>,
    cordons: u32,
    owner_lookups: u32,
    replacement_seq: u32,
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                replacement_ready_after: Some(0),
                ..Default::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("fake cluster lock poisoned");
        f(&mut state)
    }

    /// Managed, ready node created `age_days` ago
    pub fn add_node(&self, name: &str, age_days: i64) {
        self.add_node_info(managed_node(name, age_days));
    }

    pub fn add_node_info(&self, node: NodeInfo) {
        self.with(|s| s.nodes.insert(node.name.clone(), node));
    }

    pub fn add_pod(&self, pod: PodInfo) {
        self.with(|s| s.pods.insert((pod.namespace.clone(), pod.name.clone()), pod));
    }

    /// Register the ReplicaSet → Deployment link used by [`PodBuilder::deployment`].
    pub fn add_deployment(&self, namespace: &str, name: &str) {
        self.with(|s| {
            s.owners.insert(
                (namespace.to_string(), replicaset_name(name)),
                OwnerRef::new(ControllerKind::Deployment, name),
            )
        });
    }

    pub fn block_eviction(&self, pod: &str) {
        self.with(|s| s.blocked.insert(pod.to_string()));
    }

    /// Eviction is accepted but the pod never goes away (stuck finalizer).
    pub fn stick_pod(&self, pod: &str) {
        self.with(|s| s.stuck.insert(pod.to_string()));
    }

    /// The pod is deleted behind the rotator's back, so its eviction is a 404.
    pub fn vanish_on_eviction(&self, pod: &str) {
        self.with(|s| s.vanished.insert(pod.to_string()));
    }

    pub fn set_replacement_ready_after(&self, polls: Option<u32>) {
        self.with(|s| s.replacement_ready_after = polls);
    }

    /// Node that joins the cluster once the first eviction happens.
    pub fn provision_on_eviction(&self, node: NodeInfo) {
        self.with(|s| s.provision_on_eviction.push(node));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with(|s| s.unavailable = unavailable);
    }

    /// The API becomes unreachable right after the next successful cordon.
    pub fn outage_after_cordon(&self) {
        self.with(|s| s.outage_after_cordon = true);
    }

    pub fn fail_cordon_with_conflicts(&self, count: u32) {
        self.with(|s| s.conflicts = count);
    }

    pub fn evictions(&self) -> Vec<String> {
        self.with(|s| s.evictions.clone())
    }

    pub fn cordon_calls(&self) -> u32 {
        self.with(|s| s.cordons)
    }

    pub fn owner_lookups(&self) -> u32 {
        self.with(|s| s.owner_lookups)
    }

    pub fn node(&self, name: &str) -> Option<NodeInfo> {
        self.with(|s| s.nodes.get(name).cloned())
    }

    pub fn pods_on(&self, node: &str) -> Vec<PodInfo> {
        self.with(|s| {
            s.pods
                .values()
                .filter(|p| p.node_name.as_deref() == Some(node))
                .cloned()
                .collect()
        })
    }

    /// Ready replicas owned directly by `owner` across the cluster
    pub fn ready_replicas(&self, owner: &str) -> usize {
        self.with(|s| {
            s.pods
                .values()
                .filter(|p| p.owner.as_ref().is_some_and(|o| o.name == owner))
                .filter(|p| p.is_ready())
                .count()
        })
    }

    fn check_available(&self) -> Result<()> {
        if self.with(|s| s.unavailable) {
            return Err(Error::ApiUnavailable("connection refused".to_string()));
        }
        Ok(())
    }

    /// Advance replacement readiness by one observation.
    fn tick(state: &mut State) {
        let mut ready = Vec::new();
        for (key, left) in state.countdowns.iter_mut() {
            if *left == 0 {
                ready.push(key.clone());
            } else {
                *left -= 1;
            }
        }
        for key in ready {
            state.countdowns.remove(&key);
            if let Some(pod) = state.pods.get_mut(&key) {
                pod.phase = Some("Running".to_string());
                pod.ready = true;
            }
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<NodeInfo>> {
        self.check_available()?;
        let requirements: Vec<(String, String)> = label_selector
            .map(|sel| {
                sel.split(',')
                    .filter_map(|kv| kv.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(self.with(|s| {
            s.nodes
                .values()
                .filter(|n| {
                    requirements
                        .iter()
                        .all(|(k, v)| n.labels.get(k) == Some(v))
                })
                .cloned()
                .collect()
        }))
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        self.check_available()?;
        self.with(|s| s.nodes.get(name).cloned())
            .ok_or_else(|| Error::NotFound(format!("node {name}")))
    }

    async fn cordon_node(&self, name: &str, _resource_version: Option<&str>) -> Result<()> {
        self.check_available()?;
        self.with(|s| {
            s.cordons += 1;
            if s.conflicts > 0 {
                s.conflicts -= 1;
                return Err(Error::Conflict(format!("node {name}")));
            }
            let node = s
                .nodes
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("node {name}")))?;
            node.unschedulable = true;
            if s.outage_after_cordon {
                s.unavailable = true;
            }
            Ok(())
        })
    }

    async fn list_pods(&self, field_selector: Option<&str>) -> Result<Vec<PodInfo>> {
        self.check_available()?;
        let node_filter = field_selector.and_then(|f| f.strip_prefix("spec.nodeName="));
        let phase_filter = field_selector.and_then(|f| f.strip_prefix("status.phase="));
        Ok(self.with(|s| {
            Self::tick(s);
            s.pods
                .values()
                .filter(|p| node_filter.map_or(true, |n| p.node_name.as_deref() == Some(n)))
                .filter(|p| phase_filter.map_or(true, |ph| p.phase.as_deref() == Some(ph)))
                .cloned()
                .collect()
        }))
    }

    async fn list_namespaced_pods(&self, namespace: &str) -> Result<Vec<PodInfo>> {
        self.check_available()?;
        Ok(self.with(|s| {
            Self::tick(s);
            s.pods
                .values()
                .filter(|p| p.namespace == namespace)
                .cloned()
                .collect()
        }))
    }

    async fn get_owner(
        &self,
        namespace: &str,
        _kind: &ControllerKind,
        name: &str,
    ) -> Result<Option<OwnerRef>> {
        self.check_available()?;
        Ok(self.with(|s| {
            s.owner_lookups += 1;
            s.owners
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period: Option<u32>,
    ) -> Result<()> {
        self.check_available()?;
        self.with(|s| {
            let key = (namespace.to_string(), name.to_string());
            if s.vanished.contains(name) {
                s.pods.remove(&key);
                return Err(Error::NotFound(format!("pod {namespace}/{name}")));
            }
            if s.blocked.contains(name) {
                return Err(Error::EvictionBlocked {
                    pod: format!("{namespace}/{name}"),
                    reason: "Cannot evict pod as it would violate the pod's disruption budget."
                        .to_string(),
                });
            }
            let Some(pod) = s.pods.get(&key).cloned() else {
                return Err(Error::NotFound(format!("pod {namespace}/{name}")));
            };
            s.evictions.push(name.to_string());

            let provisioned: Vec<NodeInfo> = s.provision_on_eviction.drain(..).collect();
            for node in provisioned {
                s.nodes.insert(node.name.clone(), node);
            }

            if s.stuck.contains(name) {
                if let Some(p) = s.pods.get_mut(&key) {
                    p.terminating = true;
                }
                return Ok(());
            }
            s.pods.remove(&key);

            let replaceable = pod
                .owner
                .as_ref()
                .is_some_and(|o| o.kind != ControllerKind::DaemonSet);
            if !replaceable {
                return Ok(());
            }
            let target = s
                .nodes
                .values()
                .find(|n| !n.unschedulable && n.ready && pod.node_name.as_ref() != Some(&n.name))
                .map(|n| n.name.clone());
            if let Some(target) = target {
                s.replacement_seq += 1;
                let replacement_name = format!("{}-r{}", pod.name, s.replacement_seq);
                let mut replacement = PodInfo {
                    name: replacement_name.clone(),
                    node_name: Some(target),
                    phase: Some("Pending".to_string()),
                    ready: false,
                    terminating: false,
                    ..pod
                };
                let replacement_key = (namespace.to_string(), replacement_name);
                match s.replacement_ready_after {
                    Some(0) => {
                        replacement.phase = Some("Running".to_string());
                        replacement.ready = true;
                    }
                    Some(polls) => {
                        s.countdowns.insert(replacement_key.clone(), polls);
                    }
                    None => {}
                }
                s.pods.insert(replacement_key, replacement);
            }
            Ok(())
        })
    }
}

pub fn replicaset_name(deployment: &str) -> String {
    format!("{deployment}-5d8f")
}

pub fn managed_node(name: &str, age_days: i64) -> NodeInfo {
    let (key, value) = DEFAULT_MANAGED_NODE_SELECTOR
        .split_once('=')
        .expect("default selector is key=value");
    NodeInfo {
        name: name.to_string(),
        labels: BTreeMap::from([(key.to_string(), value.to_string())]),
        created: Some(Utc::now() - Duration::days(age_days)),
        unschedulable: false,
        ready: true,
        resource_version: Some("1".to_string()),
    }
}

/// Fluent construction of test pods
pub struct PodBuilder {
    pod: PodInfo,
}

impl PodBuilder {
    pub fn new(name: &str, node: &str) -> Self {
        Self {
            pod: PodInfo {
                name: name.to_string(),
                namespace: NAMESPACE.to_string(),
                node_name: Some(node.to_string()),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                owner: None,
                phase: Some("Running".to_string()),
                ready: true,
                terminating: false,
            },
        }
    }

    /// Pod owned by the ReplicaSet of `deployment`
    pub fn deployment(deployment: &str, name: &str, node: &str) -> Self {
        Self::new(name, node).owner(ControllerKind::ReplicaSet, &replicaset_name(deployment))
    }

    pub fn owner(mut self, kind: ControllerKind, name: &str) -> Self {
        self.pod.owner = Some(OwnerRef::new(kind, name));
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.pod.ready = false;
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.pod.phase = Some(phase.to_string());
        self
    }

    pub fn mirror(mut self) -> Self {
        self.pod
            .annotations
            .insert(MIRROR_POD_ANNOTATION.to_string(), "hash".to_string());
        self
    }

    pub fn unscheduled(mut self) -> Self {
        self.pod.node_name = None;
        self
    }

    pub fn build(self) -> PodInfo {
        self.pod
    }
}
