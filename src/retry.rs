//! Retry and back-off policy shared by the error classifier's retry
//! strategy and the refresh scheduler.

use std::time::Duration;

use tracing::{info, warn};

/// An exponential back-off policy with a maximum delay cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts after the first.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy matching the refresh-protocol back-off: 1 minute times
    /// `5^(attempt - 1)`, capped at 3 attempts.
    #[must_use]
    pub const fn refresh_protocol() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 125),
            multiplier: 5.0,
        }
    }

    /// A policy seeded from a classified error kind's base delay.
    #[must_use]
    pub const fn for_error_kind(base_delay: Duration) -> Self {
        Self {
            max_retries: 3,
            initial_delay: base_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// The delay to use before the given (zero-indexed) attempt.
    ///
    /// `delay_for_attempt(0)` returns `initial_delay` unchanged.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Run `operation` until it succeeds or the policy's retries are exhausted.
///
/// # Errors
///
/// Returns the last error once `policy.max_retries` attempts have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempt, "operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, %err, ?delay, "operation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(attempt, %err, "operation exhausted retries");
                return Err(err);
            }
        }
    }
}
