//! Retry policy with exponential backoff
//!
//! A job wraps every source-fetcher call in a [`RetryPolicy`] so that retry
//! behavior stays testable in isolation from orchestration. The policy
//! consults [`Error::kind`] after each failure: network and protocol errors
//! are retried on the backoff schedule, while rate-limit and fatal errors
//! abort immediately and surface to the job.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a custom attempt budget
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before the given retry (attempt 1 = first retry)
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((exponential as u64).min(self.max_delay_ms))
    }

    /// Execute `operation`, retrying retryable failures with backoff
    ///
    /// Returns the first success, or the last error once the attempt budget
    /// is exhausted or a non-retryable error appears.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    let kind = e.kind();
                    if !kind.is_retryable() {
                        warn!(kind = %kind, error = %e, "non-retryable error, aborting attempts");
                        return Err(e);
                    }

                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        kind = %kind,
                        error = %e,
                        "retryable failure"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::other("retry budget exhausted with no error")))
    }
}
