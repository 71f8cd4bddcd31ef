//! Background worker that drains the processing queue

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::job::{QueuedJob, StatusUpdate};
use super::processing_queue::ProcessingQueue;
use crate::cache::ResultCache;
use crate::cancellation;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::registry::ProcessorRegistry;
use crate::resilience::{classify, FailureType, RetryPolicy};
use crate::retry_queue::FailedRequestSink;

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Completed from the result cache without running a processor
    CacheHit { job_id: String },
    Completed { job_id: String },
    Failed {
        job_id: String,
        failure_type: FailureType,
        queued_for_retry: bool,
    },
    /// Cancelled by a caller while it was processing
    Cancelled { job_id: String },
}

/// Worker that runs queued jobs through the processor registry
pub struct QueueWorker {
    queue: Arc<ProcessingQueue>,
    registry: Arc<ProcessorRegistry>,
    cache: Option<Arc<ResultCache>>,
    retry_sink: Option<Arc<dyn FailedRequestSink>>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<ProcessingQueue>,
        registry: Arc<ProcessorRegistry>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            cache: None,
            retry_sink: None,
            policy,
            config,
        }
    }

    /// Look results up in, and write them to, the given cache
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Hand retryable failures to the given retry queue
    pub fn with_retry_queue(mut self, sink: Arc<dyn FailedRequestSink>) -> Self {
        self.retry_sink = Some(sink);
        self
    }

    /// Process jobs until cancelled
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let idle = Duration::from_millis(self.config.idle_poll_ms);
        tracing::info!("Queue worker started (idle poll {}ms)", self.config.idle_poll_ms);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let wait = match self.process_next(cancel).await {
                Ok(Some(outcome)) => {
                    tracing::debug!("Job finished: {:?}", outcome);
                    false
                }
                Ok(None) => true,
                Err(Error::Cancelled) => break,
                Err(e @ Error::Disposed(_)) => return Err(e),
                Err(e) => {
                    tracing::error!("Queue worker error: {}", e);
                    true
                }
            };

            if wait && cancellation::sleep(cancel, idle).await.is_err() {
                break;
            }
        }

        tracing::info!("Queue worker stopped");
        Ok(())
    }

    /// Claim and process the next queued job, if any
    pub async fn process_next(&self, cancel: &CancellationToken) -> Result<Option<JobOutcome>> {
        let Some(job) = self.queue.claim_next(cancel).await? else {
            return Ok(None);
        };

        tracing::info!(
            "Processing job {} ({} bytes, priority {:?})",
            job.id,
            job.request.data.len(),
            job.priority
        );

        let cached = match self.complete_from_cache(&job, cancel).await {
            Err(Error::Cancelled) => return self.abandon(&job).await,
            other => other?,
        };
        if let Some(outcome) = cached {
            return Ok(Some(outcome));
        }

        let data = job.request.data.as_slice();
        let document_type = job.request.document_type();
        let registry = self.registry.as_ref();

        let result = self
            .policy
            .execute(
                move || async move { registry.process_document(data, document_type, cancel).await },
                cancel,
            )
            .await;

        match result {
            Ok(payload) => self.complete(&job, payload, cancel).await.map(Some),
            Err(Error::Cancelled) => self.abandon(&job).await,
            Err(e) => self.fail(&job, e).await.map(Some),
        }
    }

    /// Mark a claimed job cancelled and report the cancellation
    async fn abandon(&self, job: &QueuedJob) -> Result<Option<JobOutcome>> {
        // The caller's token is gone; record the outcome regardless
        let detached = CancellationToken::new();
        self.queue.cancel_job(&job.id, &detached).await?;
        tracing::info!("Job {} cancelled during processing", job.id);
        Err(Error::Cancelled)
    }

    /// Cache key material besides the content: the explicit type tag
    fn cache_config(job: &QueuedJob) -> &[u8] {
        job.request.document_type().unwrap_or_default().as_bytes()
    }

    async fn complete_from_cache(
        &self,
        job: &QueuedJob,
        cancel: &CancellationToken,
    ) -> Result<Option<JobOutcome>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let hit = match cache
            .get_with_config(&job.request.data, Self::cache_config(job), cancel)
            .await
        {
            Ok(Some(hit)) => hit,
            Ok(None) => return Ok(None),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!("Cache lookup for job {} failed: {}", job.id, e);
                return Ok(None);
            }
        };

        tracing::info!("Job {} served from cache", job.id);
        let outcome = if self.finish(&job.id, StatusUpdate::completed(hit.result)).await? {
            JobOutcome::CacheHit {
                job_id: job.id.clone(),
            }
        } else {
            JobOutcome::Cancelled {
                job_id: job.id.clone(),
            }
        };
        Ok(Some(outcome))
    }

    async fn complete(
        &self,
        job: &QueuedJob,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        if self.config.cache_results {
            if let Some(cache) = &self.cache {
                let stored = cache
                    .store_with_config(
                        &job.request.data,
                        Self::cache_config(job),
                        payload.clone(),
                        None,
                        cancel,
                    )
                    .await;
                if let Err(e) = stored {
                    tracing::warn!("Failed to cache result of job {}: {}", job.id, e);
                }
            }
        }

        if self.finish(&job.id, StatusUpdate::completed(payload)).await? {
            tracing::info!("Job {} completed", job.id);
            Ok(JobOutcome::Completed {
                job_id: job.id.clone(),
            })
        } else {
            Ok(JobOutcome::Cancelled {
                job_id: job.id.clone(),
            })
        }
    }

    async fn fail(&self, job: &QueuedJob, error: Error) -> Result<JobOutcome> {
        // Classify on the last attempt; the aggregate itself says nothing
        let failure_type = match &error {
            Error::RetryExhausted { attempts } => attempts
                .last()
                .map(classify)
                .unwrap_or(FailureType::Unknown),
            other => classify(other),
        };
        let message = error.chain_message();
        tracing::error!("Job {} failed ({}): {}", job.id, failure_type.as_str(), message);

        let update = StatusUpdate::failed(message.clone(), Some(failure_type.as_str().to_string()));
        if !self.finish(&job.id, update).await? {
            return Ok(JobOutcome::Cancelled {
                job_id: job.id.clone(),
            });
        }

        let mut queued_for_retry = false;
        if failure_type != FailureType::Permanent {
            if let Some(sink) = &self.retry_sink {
                match sink.add_to_queue(job.request.clone(), failure_type, &message).await {
                    Ok(id) => {
                        tracing::info!("Job {} handed to retry queue as {}", job.id, id);
                        queued_for_retry = true;
                    }
                    Err(e) => tracing::warn!("Could not queue job {} for retry: {}", job.id, e),
                }
            }
        }

        Ok(JobOutcome::Failed {
            job_id: job.id.clone(),
            failure_type,
            queued_for_retry,
        })
    }

    /// Apply a terminal update; `false` when the job was cancelled meanwhile
    async fn finish(&self, job_id: &str, update: StatusUpdate) -> Result<bool> {
        let detached = CancellationToken::new();
        match self.queue.update_status(job_id, update, &detached).await {
            Ok(found) => Ok(found),
            Err(Error::InvalidOperation(_)) => {
                let status = self.queue.job(job_id).await?.map(|j| j.status);
                tracing::debug!("Job {} already {:?}, dropping worker result", job_id, status);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, QueueConfig, RetryConfig};
    use crate::processing::{DocumentRequest, JobPriority, JobStatus};
    use crate::providers::Sha256Hasher;
    use crate::registry::DocumentProcessor;
    use crate::storage::{ByteStore, InMemoryByteStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProcessor {
        calls: AtomicU32,
        error: Option<fn() -> Error>,
    }

    #[async_trait]
    impl DocumentProcessor for CountingProcessor {
        fn document_type(&self) -> &str {
            "receipt"
        }

        fn can_process(&self, _data: &[u8]) -> Result<bool> {
            Ok(true)
        }

        async fn process(&self, data: &[u8], _cancel: &CancellationToken) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.error {
                Some(make) => Err(make()),
                None => Ok(json!({"documentType": "receipt", "bytes": data.len()})),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        queued: Mutex<Vec<(DocumentRequest, FailureType)>>,
    }

    #[async_trait]
    impl FailedRequestSink for RecordingSink {
        async fn add_to_queue(
            &self,
            request: DocumentRequest,
            failure_type: FailureType,
            _message: &str,
        ) -> Result<String> {
            self.queued.lock().push((request, failure_type));
            Ok("retry-1".to_string())
        }
    }

    struct Setup {
        queue: Arc<ProcessingQueue>,
        processor: Arc<CountingProcessor>,
        sink: Arc<RecordingSink>,
        worker: QueueWorker,
    }

    /// Byte store whose reads never finish
    struct StalledStore;

    #[async_trait]
    impl ByteStore for StalledStore {
        async fn put(&self, key: &str, _data: Vec<u8>) -> Result<String> {
            Ok(key.to_string())
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn size(&self, _key: &str) -> Result<Option<u64>> {
            Ok(None)
        }

        async fn clear(&self) -> Result<usize> {
            Ok(0)
        }
    }

    async fn setup(error: Option<fn() -> Error>) -> Setup {
        setup_with_store(error, Arc::new(InMemoryByteStore::new())).await
    }

    async fn setup_with_store(error: Option<fn() -> Error>, store: Arc<dyn ByteStore>) -> Setup {
        let queue = Arc::new(ProcessingQueue::new(&QueueConfig::default()));
        queue.start().await.unwrap();

        let processor = Arc::new(CountingProcessor {
            calls: AtomicU32::new(0),
            error,
        });
        let registry = Arc::new(ProcessorRegistry::new());
        registry.register(processor.clone(), None).unwrap();

        let cache = Arc::new(ResultCache::new(
            store,
            Arc::new(Sha256Hasher),
            &CacheConfig::default(),
        ));
        let sink = Arc::new(RecordingSink::default());
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 10,
            use_jitter: false,
            ..RetryConfig::default()
        })
        .unwrap();

        let worker = QueueWorker::new(queue.clone(), registry, policy, WorkerConfig::default())
            .with_cache(cache)
            .with_retry_queue(sink.clone());

        Setup {
            queue,
            processor,
            sink,
            worker,
        }
    }

    async fn enqueue(queue: &ProcessingQueue, data: &[u8]) -> String {
        enqueue_request(queue, DocumentRequest::new(data.to_vec(), "receipt")).await
    }

    async fn enqueue_request(queue: &ProcessingQueue, request: DocumentRequest) -> String {
        queue
            .enqueue(request, JobPriority::Normal, None, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_and_caches() {
        let s = setup(None).await;
        let token = CancellationToken::new();
        let first = enqueue(&s.queue, b"same-image").await;
        let second = enqueue(&s.queue, b"same-image").await;

        let outcome = s.worker.process_next(&token).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed { job_id: first.clone() }));
        let outcome = s.worker.process_next(&token).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::CacheHit { job_id: second.clone() }));
        assert_eq!(s.processor.calls.load(Ordering::SeqCst), 1);

        let job = s.queue.job(&second).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"documentType": "receipt", "bytes": 10})));
        assert!(s.worker.process_next(&token).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_goes_to_retry_queue() {
        let s = setup(Some(|| Error::transport(Some(503), "service unavailable"))).await;
        let id = enqueue(&s.queue, b"page").await;

        let outcome = s.worker.process_next(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                job_id: id.clone(),
                failure_type: FailureType::Transient,
                queued_for_retry: true,
            })
        );
        assert_eq!(s.processor.calls.load(Ordering::SeqCst), 2);

        let job = s.queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("transient"));
        assert_eq!(s.sink.queued.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_queued() {
        let s = setup(Some(|| Error::invalid_argument("unsupported layout"))).await;
        let id = enqueue(&s.queue, b"page").await;

        let outcome = s.worker.process_next(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                job_id: id,
                failure_type: FailureType::Permanent,
                queued_for_retry: false,
            })
        );
        assert_eq!(s.processor.calls.load(Ordering::SeqCst), 1);
        assert!(s.sink.queued.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let s = setup(None).await;
        let id = enqueue(&s.queue, b"page").await;
        let token = CancellationToken::new();

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        s.worker.run(&token).await.unwrap();
        let job = s.queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let s = setup(None).await;
        enqueue(&s.queue, b"page").await;
        s.queue.pause().await.unwrap();

        assert!(s.worker.process_next(&CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_cache_lookup_cancels_job() {
        let s = setup_with_store(None, Arc::new(StalledStore)).await;
        let id = enqueue(&s.queue, b"page").await;
        let token = CancellationToken::new();

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stopper.cancel();
        });

        assert!(matches!(s.worker.process_next(&token).await, Err(Error::Cancelled)));
        let job = s.queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(s.processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_is_keyed_by_type_tag() {
        let s = setup(None).await;
        let token = CancellationToken::new();
        let tagged = enqueue(&s.queue, b"same-image").await;
        let detected = enqueue_request(&s.queue, DocumentRequest::auto_detect(b"same-image".to_vec())).await;

        let outcome = s.worker.process_next(&token).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed { job_id: tagged }));
        let outcome = s.worker.process_next(&token).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed { job_id: detected }));
        assert_eq!(s.processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_message_keeps_cause() {
        let s = setup(Some(|| Error::invalid_argument("unsupported layout"))).await;
        let id = enqueue(&s.queue, b"page").await;

        s.worker.process_next(&CancellationToken::new()).await.unwrap();
        let job = s.queue.job(&id).await.unwrap().unwrap();
        let message = job.error_message.unwrap();
        assert!(message.starts_with("Processor 'receipt' failed"));
        assert!(message.contains("unsupported layout"));
    }
}
