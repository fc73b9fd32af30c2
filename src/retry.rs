//! Bounded retry with exponential backoff for collaborator calls.
//!
//! Every call to the reasoning or device collaborator goes through
//! [`retry_with_backoff`]: each attempt runs under the policy timeout, transient
//! failures back off and try again, and the first non-retryable error (or the
//! last error once attempts are spent) is returned to the caller.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Retryable;

/// How many times to try an operation and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after each failed attempt
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Per-attempt timeout in seconds; 0 disables it
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            timeout_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Device operations get one retry on transport failure.
    pub fn device() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            timeout_secs: 30,
        }
    }

    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            timeout_secs: 0,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Backoff for the given attempt, stretched to a server-provided hint.
    /// Never exceeds `max_delay_ms`.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay_for(attempt).max(hint.unwrap_or_default());
        delay.min(Duration::from_millis(self.max_delay_ms))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        let outcome = match policy.timeout() {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(limit)),
            },
            None => op().await,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                tracing::warn!(operation, attempt, error = %err, "Non-retryable failure");
                return Err(err);
            }
            Err(err) if attempt >= attempts => {
                tracing::warn!(operation, attempts, error = %err, "Retry budget exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_with_hint(attempt, err.retry_after());
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
