//! Bounded retry for optimistic-concurrency commits.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::observability::MetricsRegistry;
use crate::{Error, Result};

/// Exponential backoff with symmetric jitter.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    /// No delay between attempts.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0).with_jitter(0.0)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            (clamped + rand::random::<f64>() * range * 2.0 - range).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_secs(1), 2.0)
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: ExponentialBackoff::new(initial_backoff, Duration::from_secs(1), 2.0),
        }
    }

    /// Retries immediately; used where contention is expected to clear fast.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: ExponentialBackoff::none(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(10))
    }
}

/// Runs `operation` until it succeeds, fails with something other than a
/// write conflict, or `policy.max_attempts` attempts have conflicted.
///
/// The attempt number (1-based) is passed in so the operation can re-read
/// fresh state and annotate its span.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    metrics: &MetricsRegistry,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(Error::Store(e)) if e.is_conflict() => {
                metrics.record_conflict();
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, error = %e, "Write conflicts exhausted retries");
                    return Err(Error::TransactionConflict { attempts: attempt });
                }
                let delay = policy.backoff.delay_for(attempt);
                warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying ledger commit after write conflict"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_exponential_backoff() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0)
                .with_jitter(0.0);

        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_exponential_backoff_max() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0)
                .with_jitter(0.0);

        assert_eq!(backoff.delay_for(10), Duration::from_millis(500));
        assert_eq!(ExponentialBackoff::none().delay_for(4), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_conflicts_retried_until_success() {
        let metrics = MetricsRegistry::new();
        let calls = AtomicU32::new(0);

        let result = with_retry(&RetryPolicy::immediate(5), &metrics, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Error::from(StoreError::conflict("account:a")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.transaction_conflicts.get(), 2);
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_attempts() {
        let metrics = MetricsRegistry::new();

        let result: Result<()> = with_retry(&RetryPolicy::immediate(4), &metrics, |_| async {
            Err(Error::from(StoreError::conflict("account:a")))
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::TransactionConflict { attempts: 4 })
        ));
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let metrics = MetricsRegistry::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&RetryPolicy::immediate(4), &metrics, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::InsufficientFunds {
                    balance: 0,
                    required: 1,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let metrics = MetricsRegistry::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(1),
                2.0,
            )
            .with_jitter(0.0),
        };
        let start = tokio::time::Instant::now();

        let _: Result<()> = with_retry(&policy, &metrics, |_| async {
            Err(Error::from(StoreError::conflict("account:a")))
        })
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
