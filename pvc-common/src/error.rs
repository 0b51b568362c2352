//! Cluster-wide error taxonomy.
//!
//! Every controller classifies failures into one of five categories,
//! which fixes the propagation policy:
//! - `Transient` failures are retried with bounded exponential backoff.
//! - `Conflict` (CAS mismatch) is re-read and retried once.
//! - `Invalid` input is surfaced in the originating task record, never retried.
//! - `Unreachable` peers feed the fence path; unreachable drivers feed the
//!   task record.
//! - `Fatal` errors restart the daemon; the cluster treats the node as dead
//!   until it returns.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur during cluster coordination.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    /// Recoverable failure (network blip, driver timeout).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Compare-and-set mismatch; the record changed underneath us.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad input or missing reference; not retried.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// A peer or driver will not respond.
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Unrecoverable local fault (session loss, config failure).
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ClusterError {
    /// Whether the retry helper may re-attempt an operation that failed
    /// with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transient(_) | ClusterError::Conflict(_))
    }
}

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap applied after doubling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Run `op` up to `policy.attempts` times, doubling the delay between
/// attempts with a small random jitter. Non-retryable errors and the
/// final failure are returned as-is.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;

    for attempt in 1..=policy.attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                let sleep_for = delay + Duration::from_millis(jitter_ms);
                warn!(
                    operation = what,
                    attempt = attempt,
                    retry_in_ms = sleep_for.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(sleep_for).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retryable_classification() {
        assert!(ClusterError::Transient("blip".into()).is_retryable());
        assert!(ClusterError::Conflict("version".into()).is_retryable());
        assert!(!ClusterError::Invalid("bad".into()).is_retryable());
        assert!(!ClusterError::Unreachable("peer".into()).is_retryable());
        assert!(!ClusterError::Fatal("session".into()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::default(), "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ClusterError::Transient("first try".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClusterError::Transient("always".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClusterError::Invalid("no".into())) }
        })
        .await;

        assert!(matches!(result, Err(ClusterError::Invalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
