//! Retry logic with exponential backoff for transient provider errors.

use crate::context::CancelToken;
use crate::error::ProviderError;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellation checks while waiting between attempts
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Configuration for retry behavior on transient errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ProviderError>,
    /// Attempts made (at least 1)
    pub attempts: u32,
}

/// Execute an operation with retry logic.
///
/// The operation receives the attempt number (1-indexed). Transient errors are
/// retried with exponential backoff; fatal errors return immediately. No new
/// attempt starts once `cancel` is set, and the wait between attempts is cut
/// short by cancellation.
///
/// `on_retry` is called with the failed attempt number, its error and the
/// delay before the next attempt.
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    on_retry: &mut dyn FnMut(u32, &ProviderError, Duration),
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Result<T, ProviderError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = operation(attempt);
        let error = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        on_retry(attempt, &error, delay);

        if !sleep_unless_cancelled(delay, cancel) {
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
            };
        }
        attempt += 1;
    }
}

/// Sleep for `delay`; returns false if cancelled first
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let until = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        thread::sleep((until - now).min(CANCEL_POLL));
    }
}
