//! ocr-pipeline: resilient job pipeline for document recognition
//!
//! Submitted documents flow through a prioritized processing queue, are
//! recognized by pluggable document-type processors, and have their results
//! cached by content hash. Remote failures are classified and retried with
//! backoff; requests that still fail are persisted and resubmitted by a
//! connectivity-aware background processor.

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod flow;
pub mod processing;
pub mod providers;
pub mod registry;
pub mod resilience;
pub mod retry_queue;
pub mod storage;

pub use cache::{CacheStatistics, CachedResult, ResultCache};
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use flow::OcrFlow;
pub use processing::{
    DocumentRequest, JobPriority, JobStatus, ProcessingQueue, QueueEvent, QueueState, QueueWorker,
    QueuedJob, StatusUpdate,
};
pub use registry::{DocumentProcessor, ProcessorInfo, ProcessorRegistry};
pub use resilience::{FailureType, PollingConfiguration, PollingService, RetryPolicy};
pub use retry_queue::{RetryQueueEvent, RetryQueueProcessor};
