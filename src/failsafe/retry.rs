//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// Same policy with a per-call attempt budget
    #[must_use]
    pub fn with_attempts(&self, attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..self.clone()
        }
    }

    /// Attempts this policy will make
    #[must_use]
    pub fn attempts(&self) -> u32 {
        if self.enabled { self.max_attempts } else { 1 }
    }

    /// Delays slept between consecutive attempts (`attempts() - 1` items)
    #[allow(clippy::cast_possible_truncation)]
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier as f32)
            .with_max_times(self.attempts().saturating_sub(1) as usize)
            .build()
    }
}

/// Execute a future with retry logic.
///
/// `f` receives the 1-based attempt number. Non-retryable errors are returned
/// immediately.
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut delays = policy.delays();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                if attempt >= policy.attempts() {
                    debug!(operation = name, attempts = attempt, "Max retry attempts reached");
                    return Err(e);
                }

                let Some(delay) = delays.next() else {
                    return Err(e);
                };
                debug!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}
