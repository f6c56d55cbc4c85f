//! Replica Relocator
//!
//! Moves one replica of an at-risk controller off a node and waits until a
//! replacement is Ready somewhere else. Only the eviction API is used, so
//! PodDisruptionBudgets stay in force; a rejected eviction is never turned
//! into a delete.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

use super::events::{EventRecord, EventRecorder, RotationAction};
#[cfg(feature = "metrics")]
use super::metrics;
use super::poll::{poll_until, PollOutcome};
use super::{evict, failure_reason, Evicted};
use crate::cluster::{ClusterApi, ClusterStateReader, ControllerKey};
use crate::config::RotationConfig;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelocationOutcome {
    /// A ready replica exists off the node; `evicted` is false when no pod
    /// had to be evicted for that
    Success { evicted: bool },
    TimedOut,
    Failed(String),
}

pub struct Relocator<'a, C: ClusterApi + ?Sized, E: EventRecorder + ?Sized> {
    reader: ClusterStateReader<'a, C>,
    cluster: &'a C,
    events: &'a E,
    poll_interval: Duration,
    timeout: Duration,
    delay_after_ready: Duration,
    grace_period: Option<u32>,
}

impl<'a, C: ClusterApi + ?Sized, E: EventRecorder + ?Sized> Relocator<'a, C, E> {
    pub fn new(cluster: &'a C, events: &'a E, config: &RotationConfig) -> Self {
        Self {
            reader: ClusterStateReader::new(cluster, config.managed_node_selector.clone()),
            cluster,
            events,
            poll_interval: config.poll_interval,
            timeout: config.relocation_timeout,
            delay_after_ready: config.delay_after_ready,
            grace_period: config.eviction_grace_period,
        }
    }

    /// Evict the lowest-named ready replica of `controller` on `node` and
    /// wait for a ready replica on another node.
    ///
    /// Only fatal API errors are returned as `Err`; everything else is
    /// folded into the outcome.
    #[instrument(skip(self), fields(controller = %controller))]
    pub async fn relocate(&self, node: &str, controller: &ControllerKey) -> Result<RelocationOutcome> {
        let outcome = self.try_relocate(node, controller).await;
        let (success, message) = match &outcome {
            Ok(RelocationOutcome::Success { .. }) => (true, format!("{controller} ready off node")),
            Ok(RelocationOutcome::TimedOut) => (
                false,
                format!(
                    "{controller} not ready elsewhere within {}s",
                    self.timeout.as_secs()
                ),
            ),
            Ok(RelocationOutcome::Failed(reason)) => (false, reason.clone()),
            Err(e) => (false, failure_reason(e)),
        };
        self.events
            .record(EventRecord::new(node, RotationAction::Relocate, success, message))
            .await;
        outcome
    }

    async fn try_relocate(&self, node: &str, controller: &ControllerKey) -> Result<RelocationOutcome> {
        let mut candidates: Vec<_> = self
            .reader
            .controller_pods_on_node(controller, node)
            .await?
            .into_iter()
            .filter(|p| p.is_ready())
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let Some(pod) = candidates.into_iter().next() else {
            info!("No ready replica of {} left on {}", controller, node);
            return Ok(RelocationOutcome::Success { evicted: false });
        };

        info!("Relocating {} of {} off node {}", pod, controller, node);
        let evicted = match evict(self.cluster, &pod, self.grace_period).await {
            Ok(Evicted::Accepted) => {
                self.events
                    .record(EventRecord::new(
                        node,
                        RotationAction::Evict,
                        true,
                        format!("evicted {pod}"),
                    ))
                    .await;
                true
            }
            Ok(Evicted::Gone) => false,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Relocation of {} failed: {}", pod, e);
                self.events
                    .record(EventRecord::new(
                        node,
                        RotationAction::Evict,
                        false,
                        failure_reason(&e),
                    ))
                    .await;
                return Ok(RelocationOutcome::Failed(failure_reason(&e)));
            }
        };

        let started = Instant::now();
        let what = format!("ready replica of {controller} off {node}");
        let reader = &self.reader;
        let waited = poll_until(&what, self.poll_interval, self.timeout, move || async move {
            let replicas = reader.controller_replicas(controller).await?;
            Ok(replicas
                .iter()
                .any(|r| r.ready && r.node.as_deref().is_some_and(|n| n != node)))
        })
        .await;

        match waited {
            Ok(PollOutcome::Ready) => {
                #[cfg(feature = "metrics")]
                metrics::observe_relocation(started.elapsed());
                info!(
                    "{} has a ready replica off {} after {}s; settling for {}s",
                    controller,
                    node,
                    started.elapsed().as_secs(),
                    self.delay_after_ready.as_secs()
                );
                sleep(self.delay_after_ready).await;
                Ok(RelocationOutcome::Success { evicted })
            }
            Ok(PollOutcome::TimedOut) => {
                warn!(
                    "{} has no ready replica off {} after {}s",
                    controller,
                    node,
                    self.timeout.as_secs()
                );
                Ok(RelocationOutcome::TimedOut)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(RelocationOutcome::Failed(failure_reason(&e))),
        }
    }
}

impl RelocationOutcome {
    /// Reason string for reporting a failed relocation
    pub fn describe(&self, controller: &ControllerKey, timeout: Duration) -> String {
        match self {
            RelocationOutcome::Success { .. } => format!("{controller} relocated"),
            RelocationOutcome::TimedOut => failure_reason(&Error::TimedOut {
                operation: format!("ready replica of {controller}"),
                timeout,
            }),
            RelocationOutcome::Failed(reason) => reason.clone(),
        }
    }
}
