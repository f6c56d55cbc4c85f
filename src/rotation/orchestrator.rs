//! Rotation Orchestrator
//!
//! A run walks `Init → ReadState → ClassifyNodes → DrainNonCritical →
//! WaitNewNodes → DrainCritical → Done`. Any fatal error moves it to
//! `Failed`, and the nodes not yet visited are reported as skipped.
//!
//! Nodes are processed strictly one at a time. Criticality is decided again
//! from a fresh replica map right before each node is relocated or drained,
//! so the up-front partition only fixes the order.

use std::collections::HashSet;

use chrono::{Local, NaiveTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

use super::classifier::{anomalies, classify, Criticality};
use super::drainer::{DrainOutcome, NodeDrainer};
use super::events::EventRecorder;
use super::failure_reason;
use super::poll::{poll_until, PollOutcome};
use super::relocator::{RelocationOutcome, Relocator};
use super::summary::{NodeOutcome, RunState, RunSummary};
use crate::cluster::{ClusterApi, ClusterStateReader, ControllerKey, NodeInfo};
use crate::config::RotationConfig;
use crate::error::{Error, Result};

/// Relocation passes per node before giving up on it
pub const MAX_RELOCATION_ROUNDS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalNode {
    pub node: String,
    pub at_risk: Vec<ControllerKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedNode {
    pub node: String,
    pub reason: String,
}

/// Ordered partition of the managed nodes for one run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPlan {
    pub non_critical: Vec<String>,
    /// Non-critical nodes hosting deferred workloads, rotated after the
    /// capacity wait
    pub deferred: Vec<String>,
    pub critical: Vec<CriticalNode>,
    pub skipped: Vec<SkippedNode>,
    pub anomalies: Vec<ControllerKey>,
}

impl RotationPlan {
    /// Nodes to visit, in processing order
    pub fn ordered(&self) -> impl Iterator<Item = &str> {
        self.non_critical
            .iter()
            .map(String::as_str)
            .chain(self.deferred.iter().map(String::as_str))
            .chain(self.critical.iter().map(|c| c.node.as_str()))
    }
}

pub struct Orchestrator<'a, C: ClusterApi + ?Sized, E: EventRecorder + ?Sized> {
    cluster: &'a C,
    events: &'a E,
    config: RotationConfig,
    clock: fn() -> NaiveTime,
}

fn local_time() -> NaiveTime {
    Local::now().time()
}

impl<'a, C: ClusterApi + ?Sized, E: EventRecorder + ?Sized> Orchestrator<'a, C, E> {
    pub fn new(cluster: &'a C, events: &'a E, config: RotationConfig) -> Self {
        Self {
            cluster,
            events,
            config,
            clock: local_time,
        }
    }

    /// Replace the wall clock consulted for the rotation cut-off.
    pub fn with_clock(mut self, clock: fn() -> NaiveTime) -> Self {
        self.clock = clock;
        self
    }

    fn reader(&self) -> ClusterStateReader<'a, C> {
        ClusterStateReader::new(self.cluster, self.config.managed_node_selector.clone())
    }

    /// Read and classify the managed nodes without touching the cluster.
    pub async fn plan(&self) -> Result<RotationPlan> {
        let (plan, _) = self.read_and_classify(&mut RunSummary::new()).await?;
        Ok(plan)
    }

    /// Execute one rotation run. Fatal errors end the run in `Failed`; they
    /// are reported through the summary rather than returned.
    #[instrument(skip(self), fields(selector = %self.config.managed_node_selector))]
    pub async fn run(self) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new();
        if let Err(e) = self.execute(&mut summary).await {
            summary.fail(failure_reason(&e));
        }
        summary.finish(started.elapsed());
        summary
    }

    async fn execute(&self, summary: &mut RunSummary) -> Result<()> {
        let (plan, known_nodes) = self.read_and_classify(summary).await?;
        summary.anomalies = plan.anomalies.clone();
        summary.planned = plan.ordered().map(str::to_string).collect();
        for skipped in &plan.skipped {
            summary.record(&skipped.node, NodeOutcome::Skipped(skipped.reason.clone()));
        }

        summary.state = RunState::DrainNonCritical;
        info!("Rotating {} non-critical nodes", plan.non_critical.len());
        if !self.process_nodes(&plan.non_critical, summary).await? {
            return Ok(());
        }

        if summary.evictions > 0 {
            summary.state = RunState::WaitNewNodes;
            if let Err(e) = self.wait_new_nodes(&known_nodes, summary).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Waiting for new nodes failed, continuing: {}", e);
            }
        } else {
            info!("No pods were evicted; not waiting for new nodes");
        }

        summary.state = RunState::DrainCritical;
        let remaining: Vec<String> = plan
            .deferred
            .iter()
            .cloned()
            .chain(plan.critical.iter().map(|c| c.node.clone()))
            .collect();
        info!(
            "Rotating {} deferred and {} critical nodes one at a time",
            plan.deferred.len(),
            plan.critical.len()
        );
        if !self.process_nodes(&remaining, summary).await? {
            return Ok(());
        }

        summary.state = RunState::Done;
        Ok(())
    }

    async fn read_and_classify(
        &self,
        summary: &mut RunSummary,
    ) -> Result<(RotationPlan, HashSet<String>)> {
        let reader = self.reader();
        summary.state = RunState::ReadState;
        let nodes = reader.list_managed_nodes().await?;
        let known_nodes: HashSet<String> = reader
            .list_all_nodes()
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect();
        let self_node = self.discover_self_node(&reader).await?;

        let mut plan = RotationPlan::default();
        let now = Utc::now();
        let mut eligible: Vec<NodeInfo> = Vec::new();
        for node in nodes {
            if self_node.as_deref() == Some(node.name.as_str()) {
                plan.skipped.push(SkippedNode {
                    node: node.name,
                    reason: "hosts the rotator".to_string(),
                });
            } else if !self.old_enough(&node, now) {
                plan.skipped.push(SkippedNode {
                    reason: format!(
                        "younger than {} days ({} days old)",
                        self.config.min_node_age_days,
                        node.age(now).num_days()
                    ),
                    node: node.name,
                });
            } else {
                eligible.push(node);
            }
        }

        summary.state = RunState::ClassifyNodes;
        let replicas = reader.build_replica_map(&eligible).await?;
        plan.anomalies = anomalies(&replicas);

        for node in &eligible {
            match classify(&node.name, &replicas) {
                Criticality::Critical(at_risk) => {
                    info!(
                        "Node {} is critical for {}",
                        node.name,
                        at_risk
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    plan.critical.push(CriticalNode {
                        node: node.name.clone(),
                        at_risk,
                    });
                }
                Criticality::NonCritical => {
                    if self.hosts_deferred_workload(&reader, &node.name).await? {
                        plan.deferred.push(node.name.clone());
                    } else {
                        plan.non_critical.push(node.name.clone());
                    }
                }
            }
        }

        info!(
            "Plan: {} non-critical, {} deferred, {} critical, {} skipped",
            plan.non_critical.len(),
            plan.deferred.len(),
            plan.critical.len(),
            plan.skipped.len()
        );
        Ok((plan, known_nodes))
    }

    fn old_enough(&self, node: &NodeInfo, now: chrono::DateTime<Utc>) -> bool {
        let min_days = i64::from(self.config.min_node_age_days);
        min_days == 0 || node.age(now) >= chrono::Duration::days(min_days)
    }

    async fn discover_self_node(&self, reader: &ClusterStateReader<'a, C>) -> Result<Option<String>> {
        if let Some(name) = &self.config.self_node_name {
            return Ok(Some(name.clone()));
        }
        if self.config.self_pod_prefix.is_empty() {
            return Ok(None);
        }
        let node = reader
            .node_of_running_pod(&self.config.self_pod_prefix)
            .await?;
        if let Some(node) = &node {
            info!("Rotator is running on node {}", node);
        }
        Ok(node)
    }

    async fn hosts_deferred_workload(
        &self,
        reader: &ClusterStateReader<'a, C>,
        node: &str,
    ) -> Result<bool> {
        if self.config.deferred_workloads.is_empty() {
            return Ok(false);
        }
        let pods = reader.pods_on_node(node).await?;
        Ok(pods.iter().any(|pod| {
            self.config
                .deferred_workloads
                .iter()
                .any(|(k, v)| pod.matches_label(k, v))
        }))
    }

    fn window_closed(&self) -> bool {
        self.config
            .last_run
            .is_some_and(|cutoff| (self.clock)() > cutoff)
    }

    /// Rotate `nodes` in order. Returns `false` when the run has to stop.
    async fn process_nodes(&self, nodes: &[String], summary: &mut RunSummary) -> Result<bool> {
        for node in nodes {
            if self.window_closed() {
                info!("Rotation window closed; leaving remaining nodes for the next run");
                summary.skip_remaining("rotation window closed");
                summary.state = RunState::Done;
                return Ok(false);
            }

            let outcome = self.rotate_node(node, summary).await?;
            summary.record(node, outcome);

            if let Some(max) = self.config.max_failures {
                if summary.failed_count() > max {
                    summary.fail("abort threshold exceeded".to_string());
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Cordon, relocate what is at risk, then drain a single node.
    ///
    /// Once the node is cordoned it always gets an outcome, even when a
    /// fatal error ends the run.
    #[instrument(skip(self, summary))]
    async fn rotate_node(&self, node: &str, summary: &mut RunSummary) -> Result<NodeOutcome> {
        let drainer = NodeDrainer::new(self.cluster, self.events, &self.config);
        if let Err(e) = drainer.cordon(node).await {
            return nonfatal(e, |e| match e {
                Error::NotFound(_) => NodeOutcome::Skipped("node no longer exists".to_string()),
                e => NodeOutcome::Failed(failure_reason(&e)),
            });
        }

        match self.relocate_and_drain(&drainer, node, summary).await {
            Err(e) => {
                summary.record(node, NodeOutcome::Failed(failure_reason(&e)));
                Err(e)
            }
            ok => ok,
        }
    }

    async fn relocate_and_drain(
        &self,
        drainer: &NodeDrainer<'a, C, E>,
        node: &str,
        summary: &mut RunSummary,
    ) -> Result<NodeOutcome> {
        if let Some(outcome) = self.relocate_at_risk(node, summary).await? {
            return Ok(outcome);
        }

        match drainer.drain(node, self.config.drain_timeout).await {
            Ok(DrainOutcome::Drained { evicted }) => {
                summary.evictions += evicted;
                Ok(NodeOutcome::Drained)
            }
            Ok(DrainOutcome::DrainTimedOut { evicted, remaining }) => {
                summary.evictions += evicted;
                Ok(NodeOutcome::Failed(format!(
                    "DrainTimedOut: {} pods left after {}s",
                    remaining.len(),
                    self.config.drain_timeout.as_secs()
                )))
            }
            Err(e) => nonfatal(e, |e| NodeOutcome::Failed(failure_reason(&e))),
        }
    }

    /// Relocate every controller that would lose its last ready replica
    /// with `node`. Returns the node's final outcome when it must not be
    /// drained.
    async fn relocate_at_risk(
        &self,
        node: &str,
        summary: &mut RunSummary,
    ) -> Result<Option<NodeOutcome>> {
        let reader = self.reader();
        let relocator = Relocator::new(self.cluster, self.events, &self.config);

        for round in 0..=MAX_RELOCATION_ROUNDS {
            let replicas = match reader.get_node(node).await {
                Ok(current) => reader.build_replica_map(std::slice::from_ref(&current)).await,
                Err(e) => Err(e),
            };
            let replicas = match replicas {
                Ok(replicas) => replicas,
                Err(e) => return nonfatal(e, |e| NodeOutcome::Failed(failure_reason(&e))).map(Some),
            };
            let at_risk = match classify(node, &replicas) {
                Criticality::NonCritical => return Ok(None),
                Criticality::Critical(at_risk) => at_risk,
            };
            if round == MAX_RELOCATION_ROUNDS {
                break;
            }

            for controller in &at_risk {
                let outcome = relocator.relocate(node, controller).await?;
                match &outcome {
                    RelocationOutcome::Success { evicted } => {
                        summary.evictions += usize::from(*evicted)
                    }
                    RelocationOutcome::TimedOut => {
                        warn!(
                            "Leaving node {} cordoned: {} could not be relocated",
                            node, controller
                        );
                        return Ok(Some(NodeOutcome::CordonedOnly(
                            outcome.describe(controller, self.config.relocation_timeout),
                        )));
                    }
                    RelocationOutcome::Failed(reason) => {
                        return Ok(Some(NodeOutcome::Failed(reason.clone())));
                    }
                }
            }
        }

        Ok(Some(NodeOutcome::Failed(format!(
            "still critical after {MAX_RELOCATION_ROUNDS} relocation rounds"
        ))))
    }

    /// Give the autoscaler a chance to add capacity before critical nodes
    /// are touched. Only waits when pods are actually pending.
    async fn wait_new_nodes(
        &self,
        known_nodes: &HashSet<String>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let reader = self.reader();
        info!(
            "Waiting {}s before checking for pending pods",
            self.config.pending_pods_delay.as_secs()
        );
        sleep(self.config.pending_pods_delay).await;

        let pending = reader.pending_pods().await?;
        if pending.is_empty() {
            info!("No pending pods; continuing without new nodes");
            return Ok(());
        }
        info!(
            "{} pods pending; waiting up to {}s for {} new ready nodes",
            pending.len(),
            self.config.new_node_timeout.as_secs(),
            self.config.min_ready_nodes
        );

        let min_ready = self.config.min_ready_nodes;
        let reader_ref = &reader;
        let waited = poll_until(
            "new ready nodes",
            self.config.poll_interval,
            self.config.new_node_timeout,
            move || async move {
                let nodes = reader_ref.list_all_nodes().await?;
                Ok(new_ready_nodes(&nodes, known_nodes).len() >= min_ready)
            },
        )
        .await?;

        let nodes = reader.list_all_nodes().await?;
        summary.new_nodes = new_ready_nodes(&nodes, known_nodes);
        summary.new_nodes.sort();
        match waited {
            PollOutcome::Ready => info!("New nodes ready: {}", summary.new_nodes.join(", ")),
            PollOutcome::TimedOut => warn!(
                "Only {} of {} new nodes ready after {}s; continuing",
                summary.new_nodes.len(),
                min_ready,
                self.config.new_node_timeout.as_secs()
            ),
        }
        Ok(())
    }
}

fn new_ready_nodes(nodes: &[NodeInfo], known: &HashSet<String>) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.ready && !known.contains(&n.name))
        .map(|n| n.name.clone())
        .collect()
}

/// Propagate fatal errors; map everything else to a node outcome.
fn nonfatal(e: Error, outcome: impl FnOnce(Error) -> NodeOutcome) -> Result<NodeOutcome> {
    if e.is_fatal() {
        Err(e)
    } else {
        Ok(outcome(e))
    }
}
