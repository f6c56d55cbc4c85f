//! Bounded polling
//!
//! Every wait in a rotation run goes through [`poll_until`]: a predicate is
//! evaluated at a fixed interval until it holds or the timeout elapses.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// Result of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
}

impl PollOutcome {
    pub fn is_ready(self) -> bool {
        self == PollOutcome::Ready
    }
}

/// Poll `check` every `interval` until it returns `true` or `timeout` passes.
///
/// The predicate is always evaluated at least once. Errors from the
/// predicate abort the wait, except `Conflict`, which is treated as "not
/// yet" and polled again.
pub async fn poll_until<F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(PollOutcome::Ready),
            Ok(false) => {}
            Err(Error::Conflict(msg)) => debug!("Conflict while waiting for {}: {}", what, msg),
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }
        debug!(
            "Still waiting for {} ({}s left)",
            what,
            (deadline - now).as_secs()
        );
        sleep(interval.min(deadline - now)).await;
    }
}

/// Run a read-modify-write, retrying with backoff while it hits `Conflict`.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(Error::Conflict(msg)) if attempt < max_retries => {
                let delay = conflict_backoff(attempt);
                debug!(
                    "Conflict on {} (attempt {}): {}; retrying in {}ms",
                    what,
                    attempt + 1,
                    msg,
                    delay.as_millis()
                );
                attempt += 1;
                sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Exponential backoff between conflict retries: 100ms doubling, capped at 6.4s
pub fn conflict_backoff(attempt: u32) -> Duration {
    Duration::from_millis(100u64.saturating_mul(2u64.saturating_pow(attempt.min(6))))
}
