//! Retry classification and exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::delivery::DeliveryError;
use crate::error::{PacerError, Result};

/// Failure texts that mean another attempt cannot succeed.
const PERMANENT_FAILURE_MARKERS: &[&str] = &[
    "invalid phone",
    "invalid number",
    "invalid address",
    "account banned",
    "account suspended",
    "blocked",
    "not found",
    "unauthorized",
];

/// Decides whether a failed delivery is retried and how long to wait.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Transient unless the reason names a permanent condition.
    pub fn is_retryable(&self, error: &DeliveryError) -> bool {
        let reason = error.reason.to_lowercase();
        !PERMANENT_FAILURE_MARKERS
            .iter()
            .any(|marker| reason.contains(marker))
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, error: &DeliveryError, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts && self.is_retryable(error)
    }

    /// `min(base * multiplier^attempt, cap)` for a 0-indexed attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently or the attempt
    /// budget runs out. Backoff is applied between attempts only.
    pub async fn execute<T, F, Fut>(&self, clock: &dyn Clock, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, DeliveryError>>,
    {
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                debug!(error = %error, "Permanent failure, not retrying");
                return Err(PacerError::DeliveryFailed(error));
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                return Err(PacerError::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.backoff_delay(attempt - 1);
            warn!(
                attempt = attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            clock.sleep(delay).await;
        }
    }
}
