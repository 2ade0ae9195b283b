//! Bounded retry with exponential backoff, a separate rate-limit budget
//! and a hard per-attempt timeout.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Result, TriageError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    /// Fixed wait after a rate-limit failure
    pub rate_limit_cooldown: Duration,
    /// Rate-limit failures that do not consume a normal attempt
    pub rate_limit_retries: u32,
    /// Jitter upper bound as a fraction of `base_delay`
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            rate_limit_cooldown: Duration::from_millis(config.rate_limit_cooldown_ms),
            rate_limit_retries: config.rate_limit_retries,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// `min(base * 2^attempt, max)` with no jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ratio <= 0.0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let fraction: f64 = rand::thread_rng().gen_range(0.0..self.jitter_ratio);
        self.base_delay.mul_f64(fraction)
    }

    /// Delay to wait after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt) + self.jitter()
    }
}

/// Run `operation` under `policy`, returning the first success or the last error
pub async fn execute_with_retry<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_with_retry_traced(operation_name, policy, operation).await.0
}

/// Same as [`execute_with_retry`], also returning every delay that was waited
pub async fn execute_with_retry_traced<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> (Result<T>, Vec<Duration>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = Vec::new();
    let mut attempts: u32 = 0;
    let mut rate_limit_hits: u32 = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(TriageError::timeout(operation_name, policy.attempt_timeout)),
        };

        let error = match outcome {
            Ok(value) => {
                if attempts > 0 || rate_limit_hits > 0 {
                    debug!(
                        "{} succeeded after {} failed attempt(s) and {} rate-limit wait(s)",
                        operation_name, attempts, rate_limit_hits
                    );
                }
                return (Ok(value), delays);
            }
            Err(e) => e,
        };

        if error.is_rate_limited() && rate_limit_hits < policy.rate_limit_retries {
            rate_limit_hits += 1;
            let delay = policy.rate_limit_cooldown;
            warn!(
                "{} rate limited ({}/{}): {}. Cooling down for {:?}...",
                operation_name, rate_limit_hits, policy.rate_limit_retries, error, delay
            );
            delays.push(delay);
            tokio::time::sleep(delay).await;
            continue;
        }

        attempts += 1;
        if error.is_permanent() || attempts >= policy.max_attempts {
            warn!(
                "{} failed (attempt {}/{}): {}. Giving up",
                operation_name, attempts, policy.max_attempts, error
            );
            return (Err(error), delays);
        }

        let delay = policy.delay_for(attempts);
        warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
            operation_name, attempts, policy.max_attempts, error, delay
        );
        delays.push(delay);
        tokio::time::sleep(delay).await;
    }
}
