//! Bounded retry for idempotent writes.
//!
//! Transient failures are retried with jittered exponential backoff until the
//! attempt budget is spent; anything else is returned to the caller on the
//! first occurrence.

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Jitter applied to every computed delay (delay * [0.5, 1.5])
const RANDOMIZATION_FACTOR: f64 = 0.5;

/// Retry budget and backoff shape
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Retry immediately; used by tests and batch tools
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    fn backoff(&self) -> ExponentialBackoff {
        jittered_backoff(self.initial_delay, self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Exponential backoff with jitter and no elapsed-time cutoff
pub(crate) fn jittered_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max.max(initial))
        .with_randomization_factor(RANDOMIZATION_FACTOR)
        .with_max_elapsed_time(None)
        .build()
}

/// Wraps a single idempotent write with bounded retries
#[derive(Debug, Clone, Default)]
pub struct RetryingWriter {
    policy: RetryPolicy,
}

impl RetryingWriter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `action` until it succeeds, fails permanently, or the budget is
    /// spent. Exhaustion yields [`PipelineError::WriteExhausted`] wrapping the
    /// final attempt's error.
    pub async fn write<T, F, Fut>(&self, operation: &str, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_retries;
        let mut backoff = self.policy.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            metrics::counter!("retry.attempts").increment(1);

            match action().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Write succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    error!(operation, attempts = attempt, error = %e, "Write retries exhausted");
                    metrics::counter!("retry.exhausted").increment(1);
                    return Err(PipelineError::WriteExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Write failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently `failures` times, then succeeds
    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<&'static str> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(PipelineError::transient("put_object", format!("blip {n}")))
        } else {
            Ok("stored")
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let writer = RetryingWriter::new(RetryPolicy::immediate(3));
        let calls = AtomicU32::new(0);

        let result = writer.write("put", || flaky(&calls, 2)).await.unwrap();

        assert_eq!(result, "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_attempt_success_makes_one_call() {
        let writer = RetryingWriter::new(RetryPolicy::immediate(3));
        let calls = AtomicU32::new(0);

        writer.write("put", || flaky(&calls, 0)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_after_exactly_max_retries() {
        let writer = RetryingWriter::new(RetryPolicy::immediate(3));
        let calls = AtomicU32::new(0);

        let err = writer.write("put", || flaky(&calls, 10)).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            PipelineError::WriteExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                // error from the final attempt, not the first
                assert!(source.to_string().contains("blip 2"));
            }
            other => panic!("expected WriteExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let writer = RetryingWriter::new(RetryPolicy::immediate(5));
        let calls = AtomicU32::new(0);

        let err = writer
            .write("put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PipelineError::NotFound("bucket".into()))
            })
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let writer = RetryingWriter::new(RetryPolicy::immediate(0));
        let calls = AtomicU32::new(0);

        let err = writer.write("put", || flaky(&calls, 1)).await.unwrap_err();

        assert!(matches!(err, PipelineError::WriteExhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let writer = RetryingWriter::new(policy);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        writer.write("put", || flaky(&calls, 2)).await.unwrap();

        // two sleeps, each at least half the nominal delay after jitter
        assert!(started.elapsed() >= Duration::from_millis(50 + 75));
    }

    #[test]
    fn test_jittered_backoff_stays_within_cap() {
        let mut backoff = jittered_backoff(Duration::from_millis(100), Duration::from_millis(400));
        for _ in 0..20 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay <= Duration::from_millis(600));
        }
    }
}
