//! Owner resolution: pod → ReplicaSet → Deployment
//!
//! A pod's controlling owner reference is walked upward until the first
//! object that has no controlling owner of its own. Only kinds that can have
//! a workload parent are looked up; the rest terminate the walk directly.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::{ClusterApi, PodInfo};
use crate::error::{Error, Result};

/// Guard against pathological owner cycles
const MAX_OWNER_DEPTH: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ControllerKind {
    ReplicaSet,
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Other(String),
}

impl ControllerKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "ReplicaSet" => Self::ReplicaSet,
            "Deployment" => Self::Deployment,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            "Job" => Self::Job,
            "CronJob" => Self::CronJob,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ReplicaSet => "ReplicaSet",
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
            Self::Other(kind) => kind,
        }
    }

    /// Whether objects of this kind may themselves be owned by a workload.
    pub fn has_owner_ref(&self) -> bool {
        matches!(self, Self::ReplicaSet | Self::Job)
    }

    /// Whether losing every replica of this kind is an outage worth
    /// protecting against during rotation.
    pub fn is_replicated_workload(&self) -> bool {
        matches!(
            self,
            Self::ReplicaSet | Self::Deployment | Self::StatefulSet
        )
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controlling owner reference as found in `metadata.ownerReferences`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub kind: ControllerKind,
    pub name: String,
}

impl OwnerRef {
    pub fn new(kind: ControllerKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Identity of a top-level controller
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ControllerKey {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Resolve the top-level controller of a pod. Bare pods resolve to `None`.
pub async fn resolve_controller<C>(cluster: &C, pod: &PodInfo) -> Result<Option<ControllerKey>>
where
    C: ClusterApi + ?Sized,
{
    let Some(mut current) = pod.owner.clone() else {
        return Ok(None);
    };

    for _ in 0..MAX_OWNER_DEPTH {
        if !current.kind.has_owner_ref() {
            break;
        }
        match cluster
            .get_owner(&pod.namespace, &current.kind, &current.name)
            .await
        {
            Ok(Some(parent)) => {
                debug!(
                    "{} {} in {} is owned by {} {}",
                    current.kind, current.name, pod.namespace, parent.kind, parent.name
                );
                current = parent;
            }
            Ok(None) => break,
            // The intermediate object is already gone; the pod is orphaned
            // from its parent, so it belongs to the object we know about.
            Err(Error::NotFound(_)) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(Some(ControllerKey {
        kind: current.kind,
        namespace: pod.namespace.clone(),
        name: current.name,
    }))
}
