//! Retry queue processor
//!
//! Joins connectivity state, the failed-request store and the submission
//! flow. Whenever the device comes online a pass runs over a bounded batch of
//! stored requests; at most one pass runs at a time.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RetryQueueConfig;
use crate::error::{Error, Result};
use crate::flow::OcrFlow;
use crate::processing::DocumentRequest;
use crate::providers::{ConnectivityService, OcrSubmissionClient};
use crate::resilience::FailureType;
use crate::storage::{FailedRequest, FailedRequestStore};

const COMPONENT: &str = "RetryQueueProcessor";
const EVENT_CAPACITY: usize = 64;

/// Notification raised by the retry queue processor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RetryQueueEvent {
    RequestSucceeded { request_id: String },
    RequestFailed {
        request_id: String,
        error: String,
        retry_count: u32,
    },
    /// One per pass
    PassCompleted {
        success_count: usize,
        failure_count: usize,
    },
}

/// Outcome counts of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryPassSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub purged_count: usize,
}

/// Snapshot returned by [`RetryQueueProcessor::get_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryQueueStatus {
    pub pending: usize,
    pub retryable: usize,
    pub is_online: bool,
    pub is_processing: bool,
}

/// Destination for requests that failed during processing
#[async_trait]
pub trait FailedRequestSink: Send + Sync {
    /// Persist a failed request; returns its record id
    async fn add_to_queue(
        &self,
        request: DocumentRequest,
        failure_type: FailureType,
        message: &str,
    ) -> Result<String>;
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Resets the in-progress flag when a pass ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Connectivity-driven resubmission of stored failed requests
pub struct RetryQueueProcessor<C: OcrSubmissionClient> {
    store: Arc<dyn FailedRequestStore>,
    connectivity: Arc<dyn ConnectivityService>,
    flow: OcrFlow<C>,
    config: RetryQueueConfig,
    events: broadcast::Sender<RetryQueueEvent>,
    processing: AtomicBool,
    disposed: AtomicBool,
    /// Parent of every pass token; cancelled on dispose
    shutdown: CancellationToken,
    current_pass: Mutex<Option<CancellationToken>>,
    monitor: Mutex<Option<Monitor>>,
}

impl<C: OcrSubmissionClient + 'static> RetryQueueProcessor<C> {
    pub fn new(
        store: Arc<dyn FailedRequestStore>,
        connectivity: Arc<dyn ConnectivityService>,
        flow: OcrFlow<C>,
        config: RetryQueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            connectivity,
            flow,
            config,
            events,
            processing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            current_pass: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed(COMPONENT));
        }
        Ok(())
    }

    fn publish(&self, event: RetryQueueEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Retry queue event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetryQueueEvent> {
        self.events.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Watch connectivity and run a pass every time the device comes online
    pub async fn start_monitoring(self: &Arc<Self>) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.is_monitoring() {
            return Ok(());
        }

        self.connectivity.start_monitoring().await;
        let mut online_rx = self.connectivity.subscribe();
        let token = self.shutdown.child_token();
        let loop_token = token.clone();
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut online = *online_rx.borrow_and_update();
            loop {
                if online {
                    let Some(processor) = weak.upgrade() else {
                        break;
                    };
                    if let Err(e) = processor.process_retry_queue().await {
                        if !e.is_cancelled() {
                            tracing::error!("Retry pass failed: {}", e);
                        }
                    }
                }

                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        online = *online_rx.borrow_and_update();
                    }
                }
            }
            tracing::debug!("Connectivity monitor stopped");
        });

        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            // Lost a race with a concurrent start
            token.cancel();
        } else {
            *monitor = Some(Monitor { token, handle });
            tracing::info!("Retry queue monitoring started");
        }
        Ok(())
    }

    /// Stop connectivity observation and cancel an in-flight pass
    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(pass) = self.current_pass.lock().as_ref() {
            pass.cancel();
        }

        if let Some(Monitor { token, handle }) = monitor {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Connectivity monitor ended abnormally: {}", e);
            }
            self.connectivity.stop_monitoring().await;
            tracing::info!("Retry queue monitoring stopped");
        }
    }

    /// Stop everything; later calls fail with a disposed error
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.stop_monitoring().await;
        tracing::info!("Retry queue processor disposed");
    }

    /// Persist a failed request for a later pass
    pub async fn add_to_queue(
        &self,
        request: DocumentRequest,
        failure_type: FailureType,
        message: &str,
    ) -> Result<String> {
        self.ensure_not_disposed()?;
        request.validate()?;

        let record = FailedRequest::new(request, failure_type, message);
        let id = record.id.clone();
        self.store.store_failed(record).await?;
        tracing::info!("Queued failed request {} for retry ({})", id, failure_type.as_str());
        Ok(id)
    }

    pub async fn get_status(&self) -> Result<RetryQueueStatus> {
        self.ensure_not_disposed()?;
        let cancel = &self.shutdown;
        let pending = self.store.pending_count(cancel).await?;
        let retryable = self
            .store
            .get_retryable(usize::MAX, self.config.max_retries, cancel)
            .await?
            .len();
        Ok(RetryQueueStatus {
            pending,
            retryable,
            is_online: self.connectivity.is_online().await,
            is_processing: self.processing.load(Ordering::SeqCst),
        })
    }

    /// Run one resubmission pass
    ///
    /// Returns immediately with zero counts when offline or when another pass
    /// is already running.
    pub async fn process_retry_queue(&self) -> Result<RetryPassSummary> {
        self.ensure_not_disposed()?;

        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Retry pass already in progress");
            return Ok(RetryPassSummary::default());
        }
        let _guard = PassGuard(&self.processing);

        if !self.connectivity.is_online().await {
            tracing::debug!("Offline, skipping retry pass");
            return Ok(RetryPassSummary::default());
        }

        let token = self.shutdown.child_token();
        *self.current_pass.lock() = Some(token.clone());
        let result = self.run_pass(&token).await;
        *self.current_pass.lock() = None;
        result
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> Result<RetryPassSummary> {
        let mut summary = RetryPassSummary {
            purged_count: self.store.remove_exhausted(self.config.max_retries, cancel).await?,
            ..RetryPassSummary::default()
        };

        let batch = self
            .store
            .get_retryable(self.config.batch_size, self.config.max_retries, cancel)
            .await?;
        tracing::info!("Retry pass started: {} requests", batch.len());

        for failed in batch {
            if cancel.is_cancelled() {
                break;
            }
            if !self.connectivity.is_online().await {
                tracing::info!("Connectivity lost, halting retry pass");
                break;
            }

            match self.flow.submit(&failed.request, cancel).await {
                Ok(_) => {
                    self.store.remove_request(&failed.id, cancel).await?;
                    summary.success_count += 1;
                    tracing::info!("Resubmitted request {}", failed.id);
                    self.publish(RetryQueueEvent::RequestSucceeded {
                        request_id: failed.id,
                    });
                }
                Err(Error::Cancelled) => {
                    tracing::info!("Retry pass cancelled");
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.store
                        .update_retry_status(&failed.id, false, Some(&message), cancel)
                        .await?;
                    summary.failure_count += 1;
                    tracing::warn!("Resubmission of {} failed: {}", failed.id, message);
                    self.publish(RetryQueueEvent::RequestFailed {
                        request_id: failed.id,
                        error: message,
                        retry_count: failed.retry_count + 1,
                    });
                }
            }
        }

        tracing::info!(
            "Retry pass completed: {} succeeded, {} failed",
            summary.success_count,
            summary.failure_count
        );
        self.publish(RetryQueueEvent::PassCompleted {
            success_count: summary.success_count,
            failure_count: summary.failure_count,
        });
        Ok(summary)
    }
}

#[async_trait]
impl<C: OcrSubmissionClient + 'static> FailedRequestSink for RetryQueueProcessor<C> {
    async fn add_to_queue(
        &self,
        request: DocumentRequest,
        failure_type: FailureType,
        message: &str,
    ) -> Result<String> {
        RetryQueueProcessor::add_to_queue(self, request, failure_type, message).await
    }
}

impl<C: OcrSubmissionClient> Drop for RetryQueueProcessor<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
