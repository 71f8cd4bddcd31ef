//! Persistence for requests that failed and await resubmission

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cancellation;
use crate::error::Result;
use crate::processing::DocumentRequest;
use crate::resilience::FailureType;

/// A request that failed and is waiting to be resubmitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRequest {
    pub id: String,
    pub request: DocumentRequest,
    pub failure_type: FailureType,
    pub failed_at: DateTime<Utc>,
    /// Resubmission attempts made so far
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl FailedRequest {
    pub fn new(request: DocumentRequest, failure_type: FailureType, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            failure_type,
            failed_at: Utc::now(),
            retry_count: 0,
            last_error: Some(message.into()),
            last_attempt_at: None,
        }
    }

    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

/// Trait for failed-request persistence
///
/// Every query takes the caller's token and fails with `Cancelled` once it fires.
///
/// Implementations:
/// - `InMemoryFailedRequestStore`: process-local list
/// - `SqliteFailedRequestStore`: SQLite table
#[async_trait]
pub trait FailedRequestStore: Send + Sync {
    /// Persist a new failed request
    async fn store_failed(&self, request: FailedRequest) -> Result<()>;

    /// Oldest-first batch of requests below `max_retries` attempts
    async fn get_retryable(
        &self,
        max_batch: usize,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<FailedRequest>>;

    /// Record a resubmission attempt; a failure bumps the retry count
    ///
    /// Returns `false` when the id is unknown
    async fn update_retry_status(
        &self,
        id: &str,
        success: bool,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Delete one request
    async fn remove_request(&self, id: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Delete every request at or above `max_retries` attempts
    async fn remove_exhausted(&self, max_retries: u32, cancel: &CancellationToken) -> Result<usize>;

    /// Number of stored requests
    async fn pending_count(&self, cancel: &CancellationToken) -> Result<usize>;

    /// Get store name for logging
    fn name(&self) -> &str;
}

/// In-memory failed-request store
#[derive(Debug, Default)]
pub struct InMemoryFailedRequestStore {
    // Insertion order is failure order
    requests: Mutex<Vec<FailedRequest>>,
}

impl InMemoryFailedRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one stored request
    pub fn get(&self, id: &str) -> Option<FailedRequest> {
        self.requests.lock().iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl FailedRequestStore for InMemoryFailedRequestStore {
    async fn store_failed(&self, request: FailedRequest) -> Result<()> {
        self.requests.lock().push(request);
        Ok(())
    }

    async fn get_retryable(
        &self,
        max_batch: usize,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<FailedRequest>> {
        cancellation::check(cancel)?;
        Ok(self
            .requests
            .lock()
            .iter()
            .filter(|r| !r.is_exhausted(max_retries))
            .take(max_batch)
            .cloned()
            .collect())
    }

    async fn update_retry_status(
        &self,
        id: &str,
        success: bool,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        cancellation::check(cancel)?;
        let mut requests = self.requests.lock();
        let Some(request) = requests.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };

        request.last_attempt_at = Some(Utc::now());
        if success {
            request.last_error = None;
        } else {
            request.retry_count += 1;
            request.last_error = message.map(str::to_string);
        }
        Ok(true)
    }

    async fn remove_request(&self, id: &str, cancel: &CancellationToken) -> Result<bool> {
        cancellation::check(cancel)?;
        let mut requests = self.requests.lock();
        let before = requests.len();
        requests.retain(|r| r.id != id);
        Ok(requests.len() != before)
    }

    async fn remove_exhausted(&self, max_retries: u32, cancel: &CancellationToken) -> Result<usize> {
        cancellation::check(cancel)?;
        let mut requests = self.requests.lock();
        let before = requests.len();
        requests.retain(|r| !r.is_exhausted(max_retries));
        Ok(before - requests.len())
    }

    async fn pending_count(&self, cancel: &CancellationToken) -> Result<usize> {
        cancellation::check(cancel)?;
        Ok(self.requests.lock().len())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
