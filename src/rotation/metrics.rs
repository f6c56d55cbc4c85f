//! Prometheus metrics for rotation runs
//!
//! # Exported metrics
//! - `node_rotation_nodes_total` (counter): processed nodes labeled by outcome.
//! - `node_rotation_evictions_total` (counter): eviction requests labeled by result.
//! - `node_rotation_relocation_duration_seconds` (histogram): time until a
//!   relocated replica was ready elsewhere.
//! - `node_rotation_run_duration_seconds` (gauge): wall time of the last run.
//!
//! A rotation run is a short-lived job, so the registry is written to a file
//! for the node-exporter textfile collector instead of being scraped.

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "drained", "cordoned_only", "skipped" or "failed"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EvictionLabels {
    /// "accepted", "gone" or "blocked"
    pub result: String,
}

pub static NODES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static EVICTIONS_TOTAL: Lazy<Family<EvictionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// 1s .. ~68min across 13 buckets
pub static RELOCATION_DURATION_SECONDS: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(exponential_buckets(1.0, 2.0, 13)));

pub static RUN_DURATION_SECONDS: Lazy<Gauge<f64, AtomicU64>> = Lazy::new(Gauge::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::with_prefix("node_rotation");
    registry.register(
        "nodes",
        "Nodes processed by rotation runs, by outcome",
        NODES_TOTAL.clone(),
    );
    registry.register(
        "evictions",
        "Eviction requests issued, by result",
        EVICTIONS_TOTAL.clone(),
    );
    registry.register(
        "relocation_duration_seconds",
        "Time for a relocated replica to become ready on another node",
        RELOCATION_DURATION_SECONDS.clone(),
    );
    registry.register(
        "run_duration_seconds",
        "Wall time of the last rotation run",
        RUN_DURATION_SECONDS.clone(),
    );
    registry
});

pub fn inc_node_outcome(outcome: &str) {
    NODES_TOTAL
        .get_or_create(&OutcomeLabels {
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn inc_eviction(result: &str) {
    EVICTIONS_TOTAL
        .get_or_create(&EvictionLabels {
            result: result.to_string(),
        })
        .inc();
}

pub fn observe_relocation(duration: Duration) {
    RELOCATION_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn set_run_duration(duration: Duration) {
    RUN_DURATION_SECONDS.set(duration.as_secs_f64());
}

/// Render the registry in the text exposition format.
pub fn render() -> Result<String> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)
        .map_err(|e| Error::ConfigError(format!("failed to encode metrics: {e}")))?;
    Ok(buffer)
}

/// Write the registry to `path`, replacing it atomically.
pub fn write_textfile(path: &Path) -> Result<()> {
    let body = render()?;
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, body)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| Error::ConfigError(format!("cannot write {}: {e}", path.display())))
}
