//! Rotation configuration
//!
//! Command-line flags mirror the environment variables the rotator has
//! always been configured with when running as a CronJob.

use std::time::Duration;

use chrono::NaiveTime;
use clap::Parser;

use crate::error::{Error, Result};

pub const DEFAULT_MANAGED_NODE_SELECTOR: &str = "provisioner.cast.ai/managed-by=cast.ai";
pub const DEFAULT_DEFERRED_WORKLOADS: &str =
    "app.kubernetes.io/name=castai-agent,app.kubernetes.io/name=castai-cluster-controller";

/// Flags for a rotation run
#[derive(Parser, Debug, Clone)]
pub struct RotationArgs {
    /// Label selector identifying managed nodes
    #[arg(
        long,
        env = "MANAGED_NODE_SELECTOR",
        default_value = DEFAULT_MANAGED_NODE_SELECTOR
    )]
    pub managed_node_selector: String,

    /// Nodes younger than this many days are skipped (0 rotates every node)
    #[arg(long, env = "MIN_NODE_AGE_DAYS", default_value_t = 7)]
    pub min_node_age_days: u32,

    /// Upper bound for draining a single node
    #[arg(long, env = "NODE_DRAIN_TIMEOUT", default_value_t = 1200)]
    pub drain_timeout_secs: u64,

    /// Upper bound for a relocated replica to become ready elsewhere
    #[arg(long, env = "RELOCATION_TIMEOUT", default_value_t = 600)]
    pub relocation_timeout_secs: u64,

    #[arg(long, env = "POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Settle time after a relocated replica reports ready
    #[arg(long, env = "DELAY_AFTER_READY", default_value_t = 10)]
    pub delay_after_ready_secs: u64,

    #[arg(long, env = "STARTUP_SLEEP_TIME", default_value_t = 20)]
    pub startup_sleep_secs: u64,

    /// Wait before checking for Pending pods after the non-critical pass
    #[arg(long, env = "DELAY_WAIT_PENDING_PODS", default_value_t = 20)]
    pub pending_pods_delay_secs: u64,

    /// Upper bound for replacement nodes to become ready
    #[arg(long, env = "NEW_NODE_TIMEOUT", default_value_t = 180)]
    pub new_node_timeout_secs: u64,

    /// Replacement nodes required before critical nodes are processed
    #[arg(long, env = "MIN_READY_NODES", default_value_t = 1)]
    pub min_ready_nodes: usize,

    /// Name fragment of the rotator's own pod, used to find its node
    #[arg(long, env = "CRON_JOB_PREFIX", default_value = "node-rotator")]
    pub self_pod_prefix: String,

    /// Node hosting the rotator, usually injected through the downward API
    #[arg(long, env = "NODE_NAME")]
    pub self_node_name: Option<String>,

    /// Comma separated `key=value` selectors of workloads whose nodes go last
    #[arg(
        long,
        env = "CRITICAL_WORKLOADS",
        default_value = DEFAULT_DEFERRED_WORKLOADS
    )]
    pub deferred_workloads: String,

    /// Local time of day (HH:MM:SS) after which no further node is started
    #[arg(long, env = "LAST_RUN")]
    pub last_run: Option<String>,

    /// Abort the run once more than this many nodes have failed
    #[arg(long, env = "MAX_FAILURES")]
    pub max_failures: Option<usize>,

    /// Grace period passed with every eviction
    #[arg(long, env = "EVICTION_GRACE_PERIOD")]
    pub eviction_grace_period_secs: Option<u32>,

    #[arg(long, env = "CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Record a Kubernetes Event for every rotation action
    #[arg(
        long,
        env = "EMIT_EVENTS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub emit_events: bool,

    #[arg(long, env = "EVENT_NAMESPACE", default_value = "default")]
    pub event_namespace: String,
}

/// Validated configuration consumed by the rotation engine
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub managed_node_selector: String,
    pub min_node_age_days: u32,
    pub drain_timeout: Duration,
    pub relocation_timeout: Duration,
    pub poll_interval: Duration,
    pub delay_after_ready: Duration,
    pub startup_sleep: Duration,
    pub pending_pods_delay: Duration,
    pub new_node_timeout: Duration,
    pub min_ready_nodes: usize,
    pub self_pod_prefix: String,
    pub self_node_name: Option<String>,
    pub deferred_workloads: Vec<(String, String)>,
    pub last_run: Option<NaiveTime>,
    pub max_failures: Option<usize>,
    pub eviction_grace_period: Option<u32>,
    pub conflict_retries: u32,
    pub emit_events: bool,
    pub event_namespace: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            managed_node_selector: DEFAULT_MANAGED_NODE_SELECTOR.to_string(),
            min_node_age_days: 7,
            drain_timeout: Duration::from_secs(1200),
            relocation_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            delay_after_ready: Duration::from_secs(10),
            startup_sleep: Duration::from_secs(20),
            pending_pods_delay: Duration::from_secs(20),
            new_node_timeout: Duration::from_secs(180),
            min_ready_nodes: 1,
            self_pod_prefix: "node-rotator".to_string(),
            self_node_name: None,
            deferred_workloads: Vec::new(),
            last_run: None,
            max_failures: None,
            eviction_grace_period: None,
            conflict_retries: 5,
            emit_events: true,
            event_namespace: "default".to_string(),
        }
    }
}

impl TryFrom<RotationArgs> for RotationConfig {
    type Error = Error;

    fn try_from(args: RotationArgs) -> Result<Self> {
        let last_run = args
            .last_run
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|e| {
                    Error::ConfigError(format!("LAST_RUN must be HH:MM:SS, got {s:?}: {e}"))
                })
            })
            .transpose()?;

        let config = Self {
            managed_node_selector: args.managed_node_selector.trim().to_string(),
            min_node_age_days: args.min_node_age_days,
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            relocation_timeout: Duration::from_secs(args.relocation_timeout_secs),
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            delay_after_ready: Duration::from_secs(args.delay_after_ready_secs),
            startup_sleep: Duration::from_secs(args.startup_sleep_secs),
            pending_pods_delay: Duration::from_secs(args.pending_pods_delay_secs),
            new_node_timeout: Duration::from_secs(args.new_node_timeout_secs),
            min_ready_nodes: args.min_ready_nodes,
            self_pod_prefix: args.self_pod_prefix,
            self_node_name: args.self_node_name.filter(|n| !n.trim().is_empty()),
            deferred_workloads: parse_selectors(&args.deferred_workloads)?,
            last_run,
            max_failures: args.max_failures,
            eviction_grace_period: args.eviction_grace_period_secs,
            conflict_retries: args.conflict_retries,
            emit_events: args.emit_events,
            event_namespace: args.event_namespace,
        };
        config.validate()?;
        Ok(config)
    }
}

impl RotationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.managed_node_selector.is_empty() {
            return Err(Error::ConfigError(
                "managed node selector must not be empty".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::ConfigError(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        for (name, timeout) in [
            ("drain timeout", self.drain_timeout),
            ("relocation timeout", self.relocation_timeout),
            ("new node timeout", self.new_node_timeout),
        ] {
            if timeout < self.poll_interval {
                return Err(Error::ConfigError(format!(
                    "{name} ({}s) is shorter than the poll interval ({}s)",
                    timeout.as_secs(),
                    self.poll_interval.as_secs()
                )));
            }
        }
        Ok(())
    }
}

/// Parse a comma separated list of `key=value` label selectors.
pub fn parse_selectors(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(Error::ConfigError(format!(
                "workload selector {s:?} is not of the form key=value"
            ))),
        })
        .collect()
}
