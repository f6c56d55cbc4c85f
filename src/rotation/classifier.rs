//! Criticality Classifier
//!
//! A node is critical when some replicated workload has every one of its
//! ready replicas on that node: removing the node would take the workload
//! to zero.

use serde::Serialize;
use tracing::warn;

use crate::cluster::{ControllerKey, ReplicaMap};
use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "class", content = "atRisk")]
pub enum Criticality {
    /// Controllers whose only ready replicas are on the node, sorted
    Critical(Vec<ControllerKey>),
    NonCritical,
}

impl Criticality {
    pub fn is_critical(&self) -> bool {
        matches!(self, Criticality::Critical(_))
    }

    pub fn at_risk(&self) -> &[ControllerKey] {
        match self {
            Criticality::Critical(controllers) => controllers,
            Criticality::NonCritical => &[],
        }
    }
}

/// Classify `node` against a freshly built replica map.
pub fn classify(node: &str, replicas: &ReplicaMap) -> Criticality {
    let mut at_risk: Vec<ControllerKey> = replicas
        .controllers_on_node(node)
        .filter(|key| key.kind.is_replicated_workload())
        .filter(|key| {
            let total = replicas.ready_count(key);
            total >= 1 && replicas.ready_on_node(key, node) == total
        })
        .cloned()
        .collect();

    if at_risk.is_empty() {
        return Criticality::NonCritical;
    }
    at_risk.sort();
    Criticality::Critical(at_risk)
}

/// Replicated workloads with no ready replica anywhere. There is nothing
/// left to protect for these, so they never block rotation.
pub fn anomalies(replicas: &ReplicaMap) -> Vec<ControllerKey> {
    let found: Vec<ControllerKey> = replicas
        .controllers()
        .filter(|key| key.kind.is_replicated_workload())
        .filter(|key| replicas.ready_count(key) == 0)
        .cloned()
        .collect();
    for key in &found {
        let anomaly = Error::AnomalyDetected(key.to_string());
        warn!(kind = anomaly.kind(), "{}; nothing to protect", anomaly);
    }
    found
}
