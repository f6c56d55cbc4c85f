//! Rotation event records
//!
//! Each cordon/evict/drain/relocate action produces an [`EventRecord`].
//! [`KubeEventRecorder`] publishes them as core/v1 Events on the Node so
//! they show up in `kubectl describe node`.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use serde::Serialize;
use tracing::{debug, error};

pub const EVENT_REASON: &str = "NodeRotation";
pub const EVENT_COMPONENT: &str = "node-rotator";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RotationAction {
    Cordon,
    Relocate,
    Evict,
    Drain,
}

impl fmt::Display for RotationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationAction::Cordon => "Cordon",
            RotationAction::Relocate => "Relocate",
            RotationAction::Evict => "Evict",
            RotationAction::Drain => "Drain",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub node: String,
    pub action: RotationAction,
    pub outcome: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        node: impl Into<String>,
        action: RotationAction,
        success: bool,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            action,
            outcome: outcome.into(),
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for rotation event records. Recording never fails the rotation.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, record: EventRecord);
}

/// Drops every record; used when event emission is disabled.
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
    async fn record(&self, record: EventRecord) {
        debug!(
            "Event emission disabled: {} {} on {}",
            record.action, record.outcome, record.node
        );
    }
}

pub struct KubeEventRecorder {
    client: Client,
    namespace: String,
    instance: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        });
        Self {
            client,
            namespace: namespace.into(),
            instance,
        }
    }

    fn build_event(&self, record: &EventRecord) -> Event {
        let time = Time(record.timestamp);
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-rotation-", record.node)),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(record.node.clone()),
                ..Default::default()
            },
            type_: Some(if record.success { "Normal" } else { "Warning" }.to_string()),
            reason: Some(EVENT_REASON.to_string()),
            message: Some(format!("{}: {}", record.action, record.outcome)),
            action: Some(record.action.to_string()),
            source: Some(EventSource {
                component: Some(EVENT_COMPONENT.to_string()),
                host: Some(self.instance.clone()),
            }),
            reporting_component: Some(EVENT_COMPONENT.to_string()),
            reporting_instance: Some(self.instance.clone()),
            event_time: Some(MicroTime(record.timestamp)),
            first_timestamp: Some(time.clone()),
            last_timestamp: Some(time),
            count: Some(1),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, record: EventRecord) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);
        let event = self.build_event(&record);
        if let Err(e) = events.create(&PostParams::default(), &event).await {
            error!(
                "Failed to record {} event for node {}: {}",
                record.action, record.node, e
            );
        }
    }
}
