//! Exponential-backoff retry policy driven by failure classification

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::classifier::{classify, FailureType};
use crate::cancellation;
use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Retry wrapper with classified, exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy; rejects a non-positive attempt budget
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `min(initial × multiplier^(attempt-1), max)`, attempts are 1-based
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let delay = initial * self.config.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        Duration::from_millis(delay.min(max) as u64)
    }

    /// Delay actually waited: the formula with ±50% jitter, never above the cap
    fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.calculate_delay(attempt);
        if !self.config.use_jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(factor).min(self.config.max_delay())
    }

    /// Run `operation`, retrying transient and unknown failures
    pub async fn execute<T, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_callback(operation, |_, _, _| {}, cancel).await
    }

    /// Like [`execute`](Self::execute), invoking `on_retry(attempt, error, delay)`
    /// once per retry before waiting
    pub async fn execute_with_callback<T, F, Fut, C>(
        &self,
        mut operation: F,
        mut on_retry: C,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: FnMut(u32, &Error, Duration),
    {
        let max_attempts = self.config.max_attempts;
        let mut failures = Vec::with_capacity(max_attempts as usize);

        for attempt in 1..=max_attempts {
            cancellation::check(cancel)?;

            let err = match cancellation::run_cancellable(cancel, operation()).await? {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_cancelled() {
                return Err(err);
            }

            let failure_type = classify(&err);
            if failure_type == FailureType::Permanent {
                tracing::warn!("Permanent failure on attempt {}, not retrying: {}", attempt, err);
                return Err(err);
            }

            if attempt == max_attempts {
                tracing::error!(
                    "Attempt {}/{} failed ({}), giving up: {}",
                    attempt,
                    max_attempts,
                    failure_type.as_str(),
                    err
                );
                failures.push(err);
                break;
            }

            let delay = self.wait_for_attempt(attempt);
            tracing::warn!(
                "Attempt {}/{} failed ({}): {}. Retrying in {}ms",
                attempt,
                max_attempts,
                failure_type.as_str(),
                err,
                delay.as_millis()
            );
            on_retry(attempt, &err, delay);
            failures.push(err);

            cancellation::sleep(cancel, delay).await?;
        }

        Err(Error::RetryExhausted { attempts: failures })
    }
}
