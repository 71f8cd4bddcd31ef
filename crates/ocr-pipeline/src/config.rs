//! Configuration for the OCR pipeline

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resilience::PollingConfiguration;

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Processing queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// In-process retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Polling of long-running remote operations
    #[serde(default)]
    pub polling: PollingConfiguration,
    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Persistent retry queue configuration
    #[serde(default)]
    pub retry_queue: RetryQueueConfig,
    /// Queue worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl PipelineConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(source).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        tracing::info!("Loaded pipeline configuration from {}", path.display());
        Self::from_toml_str(&source)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.polling.validate()?;
        if self.retry_queue.batch_size == 0 {
            return Err(Error::config("retry_queue.batch_size must be positive"));
        }
        if self.queue.event_capacity == 0 {
            return Err(Error::config("queue.event_capacity must be positive"));
        }
        Ok(())
    }
}

/// Processing queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum retries recorded on each new job (advisory)
    #[serde(default = "default_job_max_retries")]
    pub default_max_retries: u32,
    /// Capacity of the notification channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_job_max_retries() -> u32 { 3 }
fn default_event_capacity() -> usize { 256 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_job_max_retries(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Exponential backoff retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (must be positive)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomize waits by ±50%
    #[serde(default = "default_use_jitter")]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_use_jitter() -> bool { true }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: default_use_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_argument("max_attempts must be greater than zero"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_argument(
                "backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::invalid_argument(
                "max_delay_ms must not be smaller than initial_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when callers don't supply one (default: 24 hours)
    #[serde(default = "default_ttl_minutes")]
    pub default_ttl_minutes: u32,
}

fn default_ttl_minutes() -> u32 { 24 * 60 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: default_ttl_minutes(),
        }
    }
}

/// Persistent retry queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    /// Stored retries after which a request is purged
    #[serde(default = "default_retry_queue_max_retries")]
    pub max_retries: u32,
    /// Requests resubmitted per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_retry_queue_max_retries() -> u32 { 5 }
fn default_batch_size() -> usize { 10 }

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_queue_max_retries(),
            batch_size: default_batch_size(),
        }
    }
}

/// Queue worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Wait between checks when the queue has nothing to do
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Write completed results to the cache
    #[serde(default = "default_cache_results")]
    pub cache_results: bool,
}

fn default_idle_poll_ms() -> u64 { 250 }
fn default_cache_results() -> bool { true }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll_ms(),
            cache_results: default_cache_results(),
        }
    }
}
