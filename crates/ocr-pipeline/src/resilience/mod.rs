//! Failure classification, retry with backoff, and polling

pub mod classifier;
mod polling;
mod retry_policy;

pub use classifier::{classify, classify_optional, should_retry, FailureType};
pub use polling::{PollingConfiguration, PollingService};
pub use retry_policy::RetryPolicy;
