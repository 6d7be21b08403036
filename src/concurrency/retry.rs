use metrics::counter;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ConcurrencyConfig;
use crate::errors::ServiceError;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Factor to multiply delay by after each attempt
    pub backoff_factor: f64,
    /// Spread each delay by up to this fraction to keep contenders apart
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl From<&ConcurrencyConfig> for RetryConfig {
    fn from(cfg: &ConcurrencyConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: cfg.initial_backoff(),
            max_delay: cfg.max_backoff(),
            ..Default::default()
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following failed attempt `attempt` (1-based):
    /// `initial_delay * backoff_factor^(attempt-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }
}

/// Retry policy for determining if an error is retryable
pub trait RetryPolicy<E> {
    fn is_retryable(&self, error: &E) -> bool;
}

/// Retries conflict-class failures only: deadlocks, lock-wait timeouts,
/// serialization failures and version mismatches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictRetryPolicy;

impl RetryPolicy<ServiceError> for ConflictRetryPolicy {
    fn is_retryable(&self, error: &ServiceError) -> bool {
        error.is_retriable()
    }
}

/// Execute an async function with retries.
///
/// Non-retryable errors and the error of the final attempt are returned
/// unchanged.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    policy: impl RetryPolicy<E>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!("Operation succeeded after {} attempts", attempts);
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.is_retryable(&error) {
                    return Err(error);
                }
                if attempts >= config.max_attempts {
                    warn!(
                        "Operation failed after {} attempts: {}",
                        attempts, error
                    );
                    counter!("concurrency.retry.exhausted", 1);
                    return Err(error);
                }

                let delay = config.jittered(config.backoff_delay(attempts));
                warn!(
                    "Attempt {} failed: {}. Retrying in {:?}...",
                    attempts, error, delay
                );
                counter!("concurrency.retry", 1);

                sleep(delay).await;
            }
        }
    }
}
