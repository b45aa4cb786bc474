//! Bounded retry with exponential backoff for remote calls

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::remote::RemoteError;

/// How often and how patiently a remote call is retried.
///
/// Only retriable [`RemoteError`]s are retried; everything else is returned
/// after the first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within its upper half
    pub jitter: bool,
}

/// Why [`RetryPolicy::run`] gave up
#[derive(Debug)]
pub enum RetryError {
    Cancelled,
    Remote(RemoteError),
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
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Retries with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts
    /// or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retriable() || attempt >= self.max_attempts {
                return Err(RetryError::Remote(err));
            }

            let delay = err.retry_after.unwrap_or_else(|| self.backoff(attempt));
            debug!(
                op = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying remote call"
            );

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;
        }
    }
}
