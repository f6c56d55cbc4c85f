//! Rotation engine
//!
//! The [`Orchestrator`] drives a run; [`NodeDrainer`] and [`Relocator`] do
//! the mutating work, and [`classify`] decides which nodes are critical.

pub mod classifier;
pub mod drainer;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod poll;
pub mod relocator;
pub mod summary;


use tracing::debug;

use crate::cluster::{ClusterApi, PodInfo};
use crate::error::{Error, Result};

pub use classifier::{anomalies, classify, Criticality};
pub use drainer::{CordonOutcome, DrainOutcome, NodeDrainer};
pub use events::{EventRecord, EventRecorder, KubeEventRecorder, NoopRecorder, RotationAction};
pub use orchestrator::{Orchestrator, RotationPlan};
pub use poll::{poll_until, retry_on_conflict, PollOutcome};
pub use relocator::{RelocationOutcome, Relocator};
pub use summary::{NodeOutcome, RunState, RunSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Evicted {
    Accepted,
    /// The pod was already gone
    Gone,
}

/// Request eviction of `pod`. A pod that no longer exists counts as evicted.
pub(crate) async fn evict<C: ClusterApi + ?Sized>(
    cluster: &C,
    pod: &PodInfo,
    grace_period: Option<u32>,
) -> Result<Evicted> {
    let result = match cluster.evict_pod(&pod.namespace, &pod.name, grace_period).await {
        Ok(()) => Ok(Evicted::Accepted),
        Err(Error::NotFound(_)) => {
            debug!("Pod {} already gone", pod);
            Ok(Evicted::Gone)
        }
        Err(e) => Err(e),
    };

    #[cfg(feature = "metrics")]
    metrics::inc_eviction(match &result {
        Ok(Evicted::Accepted) => "accepted",
        Ok(Evicted::Gone) => "gone",
        Err(Error::EvictionBlocked { .. }) => "blocked",
        Err(_) => "error",
    });
    result
}

/// Reason string for a failure, prefixed with the error kind.
pub(crate) fn failure_reason(e: &Error) -> String {
    format!("{}: {}", e.kind(), e)
}
