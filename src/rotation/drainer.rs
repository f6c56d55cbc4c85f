//! Node Drainer
//!
//! Cordon plus eviction-based drain, in the spirit of `kubectl drain
//! --ignore-daemonsets --delete-emptydir-data`:
//! * DaemonSet pods are left alone; their controller ignores cordons.
//! * Static mirror pods cannot be evicted and are skipped.
//! * Completed pods hold no workload and are ignored.
//!
//! Everything else is evicted, so PodDisruptionBudgets are honoured.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::events::{EventRecord, EventRecorder, RotationAction};
use super::poll::{poll_until, retry_on_conflict, PollOutcome};
use super::{evict, failure_reason, Evicted};
use crate::cluster::{ClusterApi, ClusterStateReader, PodInfo};
use crate::config::RotationConfig;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CordonOutcome {
    Cordoned,
    AlreadyCordoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained { evicted: usize },
    /// Pods still present when the timeout elapsed; the node stays cordoned
    DrainTimedOut {
        evicted: usize,
        remaining: Vec<String>,
    },
}

/// Whether a pod is part of a node's drain set
pub fn is_drainable(pod: &PodInfo) -> bool {
    !pod.is_daemonset_pod() && !pod.is_mirror_pod() && !pod.is_completed()
}

pub struct NodeDrainer<'a, C: ClusterApi + ?Sized, E: EventRecorder + ?Sized> {
    reader: ClusterStateReader<'a, C>,
    cluster: &'a C,
    events: &'a E,
    poll_interval: Duration,
    grace_period: Option<u32>,
    conflict_retries: u32,
}

impl<'a, C: ClusterApi + ?Sized, E: EventRecorder + ?Sized> NodeDrainer<'a, C, E> {
    pub fn new(cluster: &'a C, events: &'a E, config: &RotationConfig) -> Self {
        Self {
            reader: ClusterStateReader::new(cluster, config.managed_node_selector.clone()),
            cluster,
            events,
            poll_interval: config.poll_interval,
            grace_period: config.eviction_grace_period,
            conflict_retries: config.conflict_retries,
        }
    }

    /// Mark `node` unschedulable. Cordoning a cordoned node is a no-op.
    #[instrument(skip(self))]
    pub async fn cordon(&self, node: &str) -> Result<CordonOutcome> {
        let result = retry_on_conflict(node, self.conflict_retries, move || async move {
            let current = self.reader.get_node(node).await?;
            if current.unschedulable {
                return Ok(CordonOutcome::AlreadyCordoned);
            }
            self.cluster
                .cordon_node(node, current.resource_version.as_deref())
                .await?;
            Ok(CordonOutcome::Cordoned)
        })
        .await;

        let record = match &result {
            Ok(CordonOutcome::Cordoned) => {
                info!("Node {} cordoned", node);
                EventRecord::new(node, RotationAction::Cordon, true, "cordoned")
            }
            Ok(CordonOutcome::AlreadyCordoned) => {
                info!("Node {} already cordoned", node);
                EventRecord::new(node, RotationAction::Cordon, true, "already cordoned")
            }
            Err(e) => {
                warn!("Failed to cordon node {}: {}", node, e);
                EventRecord::new(node, RotationAction::Cordon, false, failure_reason(e))
            }
        };
        self.events.record(record).await;
        result
    }

    /// Evict every drainable pod on `node` and wait until none is left.
    ///
    /// A rejected eviction fails the drain with `EvictionBlocked` right
    /// away; it is not retried within the run.
    #[instrument(skip(self), fields(timeout = timeout.as_secs()))]
    pub async fn drain(&self, node: &str, timeout: Duration) -> Result<DrainOutcome> {
        let started = Instant::now();
        self.events
            .record(EventRecord::new(node, RotationAction::Drain, true, "drain started"))
            .await;

        let result = self.evict_and_wait(node, timeout, started).await;
        let record = match &result {
            Ok(DrainOutcome::Drained { evicted }) => {
                info!(
                    "Node {} drained ({} pods evicted in {}s)",
                    node,
                    evicted,
                    started.elapsed().as_secs()
                );
                EventRecord::new(node, RotationAction::Drain, true, "drain completed")
            }
            Ok(DrainOutcome::DrainTimedOut { remaining, .. }) => {
                warn!(
                    "Drain of node {} timed out after {}s; {} pods remain: {:?}",
                    node,
                    timeout.as_secs(),
                    remaining.len(),
                    remaining
                );
                EventRecord::new(
                    node,
                    RotationAction::Drain,
                    false,
                    format!("drain timed out with {} pods remaining", remaining.len()),
                )
            }
            Err(e) => EventRecord::new(node, RotationAction::Drain, false, failure_reason(e)),
        };
        self.events.record(record).await;
        result
    }

    async fn evict_and_wait(
        &self,
        node: &str,
        timeout: Duration,
        started: Instant,
    ) -> Result<DrainOutcome> {
        let targets: Vec<PodInfo> = self
            .reader
            .pods_on_node(node)
            .await?
            .into_iter()
            .filter(is_drainable)
            .collect();
        info!("Draining node {}: {} pods to evict", node, targets.len());

        let mut evicted = 0;
        for pod in targets.iter().filter(|p| !p.terminating) {
            match evict(self.cluster, pod, self.grace_period).await {
                Ok(Evicted::Gone) => debug!("{} left node {} before eviction", pod, node),
                Ok(Evicted::Accepted) => {
                    evicted += 1;
                    self.events
                        .record(EventRecord::new(
                            node,
                            RotationAction::Evict,
                            true,
                            format!("evicted {pod}"),
                        ))
                        .await;
                }
                Err(e) => {
                    warn!("Eviction of {} on node {} failed: {}", pod, node, e);
                    self.events
                        .record(EventRecord::new(
                            node,
                            RotationAction::Evict,
                            false,
                            failure_reason(&e),
                        ))
                        .await;
                    return Err(e);
                }
            }
        }

        let reader = &self.reader;
        let remaining_time = timeout.saturating_sub(started.elapsed());
        let waited = poll_until(
            &format!("drain of {node}"),
            self.poll_interval,
            remaining_time,
            move || async move {
                let left = reader.pods_on_node(node).await?;
                Ok(!left.iter().any(is_drainable))
            },
        )
        .await?;

        match waited {
            PollOutcome::Ready => Ok(DrainOutcome::Drained { evicted }),
            PollOutcome::TimedOut => {
                let remaining = self
                    .reader
                    .pods_on_node(node)
                    .await?
                    .iter()
                    .filter(|p| is_drainable(p))
                    .map(ToString::to_string)
                    .collect();
                Ok(DrainOutcome::DrainTimedOut { evicted, remaining })
            }
        }
    }
}
