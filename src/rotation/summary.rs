//! Run summary
//!
//! Every node in a run ends with exactly one [`NodeOutcome`]; the summary is
//! what the operator sees, so nothing is reported as a silent partial
//! success.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

#[cfg(feature = "metrics")]
use super::metrics;
use crate::cluster::ControllerKey;

/// Orchestrator state machine
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason")]
pub enum RunState {
    Init,
    ReadState,
    ClassifyNodes,
    DrainNonCritical,
    WaitNewNodes,
    DrainCritical,
    Done,
    Failed(String),
}

impl RunState {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunState::Failed(_))
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Failed(reason) => write!(f, "Failed({reason})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum NodeOutcome {
    Drained,
    /// Cordoned but deliberately not drained
    CordonedOnly(String),
    Skipped(String),
    Failed(String),
}

impl NodeOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, NodeOutcome::Failed(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            NodeOutcome::Drained => None,
            NodeOutcome::CordonedOnly(r) | NodeOutcome::Skipped(r) | NodeOutcome::Failed(r) => {
                Some(r)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeOutcome::Drained => "drained",
            NodeOutcome::CordonedOnly(_) => "cordoned_only",
            NodeOutcome::Skipped(_) => "skipped",
            NodeOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Drained => f.write_str("Drained"),
            NodeOutcome::CordonedOnly(r) => write!(f, "CordonedOnly({r})"),
            NodeOutcome::Skipped(r) => write!(f, "Skipped({r})"),
            NodeOutcome::Failed(r) => write!(f, "Failed({r})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: String,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub state: RunState,
    pub started: DateTime<Utc>,
    pub duration_seconds: f64,
    pub nodes: Vec<NodeReport>,
    /// Controllers that had no ready replica when the run started
    pub anomalies: Vec<ControllerKey>,
    pub evictions: usize,
    /// Nodes that joined while the run waited for capacity
    pub new_nodes: Vec<String>,
    /// Nodes the plan intends to visit, in order
    #[serde(skip)]
    pub(crate) planned: Vec<String>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            state: RunState::Init,
            started: Utc::now(),
            duration_seconds: 0.0,
            nodes: Vec::new(),
            anomalies: Vec::new(),
            evictions: 0,
            new_nodes: Vec::new(),
            planned: Vec::new(),
        }
    }

    pub fn record(&mut self, node: &str, outcome: NodeOutcome) {
        match &outcome {
            NodeOutcome::Failed(reason) => warn!("Node {} failed: {}", node, reason),
            other => info!("Node {}: {}", node, other),
        }
        #[cfg(feature = "metrics")]
        metrics::inc_node_outcome(outcome.label());
        self.nodes.push(NodeReport {
            node: node.to_string(),
            outcome,
        });
    }

    pub fn outcome_of(&self, node: &str) -> Option<&NodeOutcome> {
        self.nodes
            .iter()
            .find(|r| r.node == node)
            .map(|r| &r.outcome)
    }

    pub fn failed_count(&self) -> usize {
        self.nodes.iter().filter(|r| r.outcome.is_failed()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.state.is_failed() || self.failed_count() > 0
    }

    /// Process exit code for the run
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    /// Report every planned node that has no outcome yet as skipped.
    pub(crate) fn skip_remaining(&mut self, reason: &str) {
        let remaining: Vec<String> = self
            .planned
            .iter()
            .filter(|n| self.outcome_of(n).is_none())
            .cloned()
            .collect();
        for node in remaining {
            self.record(&node, NodeOutcome::Skipped(reason.to_string()));
        }
    }

    pub(crate) fn fail(&mut self, reason: String) {
        warn!("Rotation run failed: {}", reason);
        self.state = RunState::Failed(reason);
        self.skip_remaining("run aborted");
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.duration_seconds = elapsed.as_secs_f64();
        #[cfg(feature = "metrics")]
        metrics::set_run_duration(elapsed);
    }

    /// Log the summary as an aligned block.
    pub fn log(&self) {
        let width = self.nodes.iter().map(|r| r.node.len()).max().unwrap_or(4);
        info!(
            "Rotation run finished in state {} after {:.0}s ({} evictions)",
            self.state, self.duration_seconds, self.evictions
        );
        for report in &self.nodes {
            info!("  {:<width$}  {}", report.node, report.outcome, width = width);
        }
        if !self.new_nodes.is_empty() {
            info!("  new nodes: {}", self.new_nodes.join(", "));
        }
        for key in &self.anomalies {
            warn!("  anomaly: {} had no ready replicas", key);
        }
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_reflects_failures() {
        let mut summary = RunSummary::new();
        summary.state = RunState::Done;
        summary.record("node-a", NodeOutcome::Drained);
        summary.record("node-b", NodeOutcome::Skipped("younger than 7 days".into()));
        assert_eq!(summary.exit_code(), 0);

        summary.record("node-c", NodeOutcome::Failed("EvictionBlocked: pdb".into()));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failed_count(), 1);
    }

    #[test]
    fn test_fail_skips_unvisited_nodes() {
        let mut summary = RunSummary::new();
        summary.planned = vec!["node-a".into(), "node-b".into(), "node-c".into()];
        summary.record("node-a", NodeOutcome::Drained);
        summary.fail("ApiUnavailable: connection refused".into());

        assert!(summary.state.is_failed());
        assert_eq!(summary.outcome_of("node-a"), Some(&NodeOutcome::Drained));
        assert_eq!(
            summary.outcome_of("node-c"),
            Some(&NodeOutcome::Skipped("run aborted".into()))
        );
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_summary_serializes_outcomes() {
        let mut summary = RunSummary::new();
        summary.record("node-a", NodeOutcome::CordonedOnly("TimedOut".into()));
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["state"]["state"], "Init");
        assert_eq!(value["nodes"][0]["node"], "node-a");
        assert_eq!(value["nodes"][0]["outcome"], "CordonedOnly");
        assert_eq!(value["nodes"][0]["reason"], "TimedOut");
        assert!(value.get("planned").is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(RunState::DrainCritical.to_string(), "DrainCritical");
        assert_eq!(
            RunState::Failed("abort threshold exceeded".into()).to_string(),
            "Failed(abort threshold exceeded)"
        );
        assert_eq!(
            NodeOutcome::Skipped("hosts the rotator".into()).to_string(),
            "Skipped(hosts the rotator)"
        );
    }
}
