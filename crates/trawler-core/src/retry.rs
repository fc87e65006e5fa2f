//! Exponential backoff shared by every outbound call path.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

/// Backoff schedule applied to transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per retry.
    pub factor: u32,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Fraction of the delay randomised away to avoid thundering herds.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given zero-based retry attempt, jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self
            .initial_delay
            .saturating_mul(self.factor.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter_ratio <= 0.0 {
            return scaled;
        }
        let jitter = rand::rng().random_range(0.0..=self.jitter_ratio);
        scaled.mul_f64(1.0 - jitter)
    }

    /// Run `operation`, retrying transient failures until the schedule is
    /// exhausted. Cancellation wins over any pending sleep.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, any non-retryable
    /// error immediately, or [`DriverError::Cancelled`] when `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> DriverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let mut attempt = 0_u32;
        loop {
            if cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    debug!(attempt, delay_ms, error = %error, "retrying after transient failure");
                    attempt += 1;
                    tokio::select! {
                        () = cancel.cancelled() => return Err(DriverError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}
