//! Retry Logic with Exponential Backoff
//!
//! Opening a stream to a replica and waiting for its commit acknowledgement are the
//! two replica interactions the sink retries. Appends are never retried: a failed
//! append leaves the replica in an unknown state and cancels the load.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │ open_node / close_replica│ LoadSink
//! └──────┬───────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 5            │
//! │  - initial_backoff: 100ms    │
//! │  - max_backoff: 30s          │
//! │  - backoff_multiplier: 2.0   │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 100ms (backoff)
//!        ├─→ Attempt 3: Wait 200ms (backoff * 2)
//!        ├─→ Attempt 4: Wait 400ms (backoff * 4)
//!        └─→ ...capped at max_backoff
//! ```
//!
//! ## Retryable vs Non-Retryable Errors
//!
//! **Retryable**: [`ReplicaErrorKind::Unavailable`], [`ReplicaErrorKind::Timeout`]
//!
//! **Non-Retryable**: [`ReplicaErrorKind::Rejected`], [`ReplicaErrorKind::Internal`].
//! A replica that answered with a failure will answer the same way again.
//!
//! ## Examples
//!
//! ```ignore
//! use tabletsink::retry::{RetryPolicy, retry_with_backoff};
//!
//! let policy = RetryPolicy::default();
//!
//! let stream = retry_with_backoff(&policy, || transport.open_stream(node, &params)).await?;
//! ```
//!
//! [`ReplicaErrorKind::Unavailable`]: tabletsink_core::ReplicaErrorKind::Unavailable
//! [`ReplicaErrorKind::Timeout`]: tabletsink_core::ReplicaErrorKind::Timeout
//! [`ReplicaErrorKind::Rejected`]: tabletsink_core::ReplicaErrorKind::Rejected
//! [`ReplicaErrorKind::Internal`]: tabletsink_core::ReplicaErrorKind::Internal

use std::future::Future;
use std::time::Duration;
use tabletsink_core::ReplicaError;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// # Backoff Calculation
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
///
/// The sink builds its policy from [`RetryConfig`](crate::config::RetryConfig);
/// `Default` is the policy used when a caller drives the helpers directly.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt number (0-indexed).
    ///
    /// ```ignore
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(0), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(1), Duration::from_millis(200));
    /// ```
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    /// Backoff for `attempt` scaled by a random factor in `0.75..1.25`.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + (rand::random::<f64>() * 0.5);
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }

    /// Check if a replica error is worth another attempt.
    pub fn is_retryable(&self, err: &ReplicaError) -> bool {
        err.is_retryable()
    }
}

/// Retry a replica operation with exponential backoff.
///
/// Returns the first success, the first non-retryable error, or the last error once
/// `max_retries` retries have been spent.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, ReplicaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReplicaError>>,
{
    run(policy, operation, false).await
}

/// Retry a replica operation with jittered exponential backoff.
///
/// Many sinks of the same load lose a node at the same moment; jitter keeps their
/// reconnect attempts from landing together.
///
/// ```text
/// jittered_backoff = backoff * (0.75 + random(0.0, 0.5))
/// ```
pub async fn retry_with_jittered_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, ReplicaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReplicaError>>,
{
    run(policy, operation, true).await
}

async fn run<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
    jitter: bool,
) -> Result<T, ReplicaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReplicaError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Replica operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !policy.is_retryable(&err) {
                    warn!(
                        node = %err.node,
                        kind = %err.kind,
                        message = %err.message,
                        "Non-retryable replica error, giving up"
                    );
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        node = %err.node,
                        kind = %err.kind,
                        message = %err.message,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = if jitter {
                    policy.jittered_backoff(attempt)
                } else {
                    policy.backoff(attempt)
                };
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    node = %err.node,
                    kind = %err.kind,
                    message = %err.message,
                    "Retryable replica error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
