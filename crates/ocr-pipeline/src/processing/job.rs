//! Job, priority and status types for the processing queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Job priority (higher is served first)
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Per-job lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled jobs are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Queued and processing jobs may be cancelled directly
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }

    /// Forward-only transitions reachable through a status update.
    /// `Failed -> Queued` is only reachable through an explicit retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(next, JobStatus::Processing | JobStatus::Cancelled),
            JobStatus::Processing => next.is_terminal(),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

/// Queue-level lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Stopped,
    Running,
    Paused,
    Stopping,
}

/// A document submitted for recognition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    /// Raw document bytes (image or PDF)
    pub data: Vec<u8>,
    /// Document-type tag; empty means auto-detect
    pub document_type: String,
}

impl DocumentRequest {
    pub fn new(data: Vec<u8>, document_type: impl Into<String>) -> Self {
        Self {
            data,
            document_type: document_type.into(),
        }
    }

    /// Request whose processor is detected from the content
    pub fn auto_detect(data: Vec<u8>) -> Self {
        Self::new(data, "")
    }

    /// The explicit type tag, if any
    pub fn document_type(&self) -> Option<&str> {
        let trimmed = self.document_type.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::invalid_argument("Request data cannot be empty"));
        }
        Ok(())
    }
}

/// One submitted document under queue management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub request: DocumentRequest,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    /// Set when the job enters `Processing`
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based position among queued jobs; `None` once out of the queue
    pub queue_position: Option<usize>,
    pub retry_count: u32,
    /// Advisory; the queue itself never refuses a retry
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    /// Opaque processing result
    pub result: Option<serde_json::Value>,
    pub processing_time_ms: Option<u64>,
    pub metadata: HashMap<String, String>,
    /// Enqueue order, breaks timestamp ties
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl QueuedJob {
    pub(crate) fn new(
        request: DocumentRequest,
        priority: JobPriority,
        metadata: HashMap<String, String>,
        max_retries: u32,
        sequence: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            priority,
            status: JobStatus::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            queue_position: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            error_code: None,
            result: None,
            processing_time_ms: None,
            metadata,
            sequence,
        }
    }

    /// Sort key: priority descending, then enqueue time ascending
    pub(crate) fn order_key(&self) -> (Reverse<JobPriority>, DateTime<Utc>, u64) {
        (Reverse(self.priority), self.enqueued_at, self.sequence)
    }

    pub fn has_exceeded_max_retries(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

/// A status change applied through [`ProcessingQueue::update_status`](super::ProcessingQueue::update_status)
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error_message: None,
            error_code: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self::new(JobStatus::Completed).with_result(result)
    }

    pub fn failed(message: impl Into<String>, code: Option<String>) -> Self {
        let mut update = Self::new(JobStatus::Failed);
        update.error_message = Some(message.into());
        update.error_code = code;
        update
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, code: Option<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_code = code;
        self
    }
}
