//! Bounded retry decorator for store mutations and provider calls.
//!
//! Only errors that classify themselves as transient are retried. Everything else (constraint
//! violations, rejected submissions, bad signatures) is returned on the first attempt, so wrapping a
//! non-idempotent call never repeats a side effect that is known to have been applied.

use serde::{Deserialize, Serialize};
use std::{fmt::Display, future::Future, time::Duration};

/// Classification of an error as safe to retry.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: u32,
    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_backoff(self.base_delay, self.backoff_factor, attempt, self.max_delay)
    }
}

/// `base * factor^attempt`, capped at `max`.
pub fn exponential_backoff(base: Duration, factor: u32, attempt: u32, max: Duration) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let exponential = base_ms.saturating_mul((factor as u64).saturating_pow(attempt));
    Duration::from_millis(exponential).min(max)
}

/// Run `operation` until it succeeds, fails permanently, or the attempts run out.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = op_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(operation = op_name, attempts = attempt + 1, error = %e, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}
