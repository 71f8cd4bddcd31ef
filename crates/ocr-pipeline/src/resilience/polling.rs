//! Poll-until-complete loop with exponential backoff
//!
//! Two independent limits apply to every poll:
//! - total elapsed time (`max_polling_duration_secs`)
//! - attempt count (`max_attempts`, optional). The initial poll is not
//!   counted against it, so `max_attempts = 3` runs the operation 4 times
//!   before giving up.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancellation;
use crate::error::{Error, Result};

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfiguration {
    /// Wait after the first non-terminal poll
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    /// Growth factor between waits
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap for a single wait
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Total time budget
    #[serde(default = "default_max_polling_duration_secs")]
    pub max_polling_duration_secs: u64,
    /// Polls allowed after the initial one
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Grow waits exponentially; otherwise wait `initial_interval_ms` each time
    #[serde(default = "default_use_exponential_backoff")]
    pub use_exponential_backoff: bool,
}

fn default_initial_interval_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 1.5 }
fn default_max_interval_ms() -> u64 { 30_000 }
fn default_max_polling_duration_secs() -> u64 { 300 }
fn default_use_exponential_backoff() -> bool { true }

impl Default for PollingConfiguration {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            max_polling_duration_secs: default_max_polling_duration_secs(),
            max_attempts: None,
            use_exponential_backoff: default_use_exponential_backoff(),
        }
    }
}

impl PollingConfiguration {
    /// Short intervals for quick OCR operations (1 minute budget)
    pub fn fast() -> Self {
        Self {
            initial_interval_ms: 500,
            backoff_multiplier: 1.5,
            max_interval_ms: 5_000,
            max_polling_duration_secs: 60,
            max_attempts: None,
            use_exponential_backoff: true,
        }
    }

    /// Long intervals for multi-page documents (30 minute budget)
    pub fn slow() -> Self {
        Self {
            initial_interval_ms: 5_000,
            backoff_multiplier: 2.0,
            max_interval_ms: 60_000,
            max_polling_duration_secs: 30 * 60,
            max_attempts: None,
            use_exponential_backoff: true,
        }
    }

    pub fn max_polling_duration(&self) -> Duration {
        Duration::from_secs(self.max_polling_duration_secs)
    }

    /// Wait after the given 1-based attempt
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return Duration::from_millis(self.initial_interval_ms);
        }
        let exponent = attempt.max(1) - 1;
        let interval = self.initial_interval_ms as f64
            * self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        Duration::from_millis(interval.min(self.max_interval_ms as f64) as u64)
    }

    /// Reject non-positive intervals, durations and attempt counts
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval_ms == 0 {
            return Err(Error::invalid_argument("initial_interval_ms must be positive"));
        }
        if self.max_interval_ms == 0 {
            return Err(Error::invalid_argument("max_interval_ms must be positive"));
        }
        if self.max_polling_duration_secs == 0 {
            return Err(Error::invalid_argument("max_polling_duration_secs must be positive"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::invalid_argument("max_attempts must be positive when set"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 0.0 {
            return Err(Error::invalid_argument("backoff_multiplier must be positive"));
        }
        Ok(())
    }
}

/// Generic poll-until-complete service
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingService;

impl PollingService {
    pub fn new() -> Self {
        Self
    }

    /// Call `operation` until `is_complete` accepts its result
    pub async fn poll<T, F, Fut, P>(
        &self,
        operation: F,
        is_complete: P,
        config: &PollingConfiguration,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&T) -> bool,
    {
        self.poll_with_progress(operation, is_complete, |_| {}, config, cancel)
            .await
    }

    /// Like [`poll`](Self::poll), reporting every result to `on_progress`
    pub async fn poll_with_progress<T, F, Fut, P, G>(
        &self,
        mut operation: F,
        is_complete: P,
        mut on_progress: G,
        config: &PollingConfiguration,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&T) -> bool,
        G: FnMut(&T),
    {
        config.validate()?;

        let started = Instant::now();
        let max_duration = config.max_polling_duration();
        let mut attempt: u32 = 0;

        loop {
            cancellation::check(cancel)?;
            attempt += 1;

            let result = cancellation::run_cancellable(cancel, operation()).await??;
            on_progress(&result);

            if is_complete(&result) {
                tracing::debug!("Polling completed after {} attempts", attempt);
                return Ok(result);
            }

            if let Some(max_attempts) = config.max_attempts {
                if attempt > max_attempts {
                    tracing::warn!("Polling gave up after {} attempts", attempt);
                    return Err(Error::timeout(format!(
                        "Polling exceeded maximum attempts ({} allowed, {} made)",
                        max_attempts, attempt
                    )));
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= max_duration {
                tracing::warn!("Polling gave up after {:.1}s", elapsed.as_secs_f64());
                return Err(Error::timeout(format!(
                    "Polling exceeded maximum duration of {}s",
                    config.max_polling_duration_secs
                )));
            }

            let wait = config
                .interval_for_attempt(attempt)
                .min(max_duration - elapsed);
            tracing::trace!("Poll attempt {} incomplete, waiting {}ms", attempt, wait.as_millis());
            cancellation::sleep(cancel, wait).await?;
        }
    }
}
