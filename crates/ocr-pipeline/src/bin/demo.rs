//! Pipeline demo binary
//!
//! Run with: cargo run -p ocr-pipeline --bin ocr-pipeline-demo [config.toml]

use async_trait::async_trait;
use ocr_pipeline::{
    config::PipelineConfig,
    providers::{ManualConnectivity, OcrSubmissionClient, Sha256Hasher, SubmissionResponse, SubmissionStatus},
    storage::{InMemoryByteStore, InMemoryFailedRequestStore},
    DocumentProcessor, DocumentRequest, JobPriority, JobStatus, OcrFlow, ProcessingQueue,
    ProcessorInfo, ProcessorRegistry, QueueWorker, ResultCache, RetryPolicy, RetryQueueProcessor,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Treats UTF-8 input as an already-recognized text layer
struct PlainTextProcessor;

#[async_trait]
impl DocumentProcessor for PlainTextProcessor {
    fn document_type(&self) -> &str {
        "plain-text"
    }

    fn can_process(&self, data: &[u8]) -> ocr_pipeline::Result<bool> {
        Ok(std::str::from_utf8(data).is_ok())
    }

    async fn process(
        &self,
        data: &[u8],
        _cancel: &CancellationToken,
    ) -> ocr_pipeline::Result<serde_json::Value> {
        let text = String::from_utf8_lossy(data);
        Ok(serde_json::json!({
            "documentType": "plain-text",
            "text": text,
            "words": text.split_whitespace().count(),
        }))
    }
}

/// Fails every image so the retry queue has work
struct ImageProcessor;

#[async_trait]
impl DocumentProcessor for ImageProcessor {
    fn document_type(&self) -> &str {
        "image"
    }

    fn can_process(&self, data: &[u8]) -> ocr_pipeline::Result<bool> {
        Ok(data.starts_with(&[0xFF, 0xD8]) || data.starts_with(b"\x89PNG"))
    }

    async fn process(
        &self,
        _data: &[u8],
        _cancel: &CancellationToken,
    ) -> ocr_pipeline::Result<serde_json::Value> {
        Err(ocr_pipeline::Error::transport(Some(503), "recognition service unavailable"))
    }
}

/// Accepts every resubmission
struct LoopbackClient {
    submissions: AtomicU32,
}

#[async_trait]
impl OcrSubmissionClient for LoopbackClient {
    type Response = SubmissionResponse;

    async fn submit(
        &self,
        _data: &[u8],
        _document_type: &str,
        _cancel: &CancellationToken,
    ) -> ocr_pipeline::Result<SubmissionResponse> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmissionResponse::new(format!("loopback-{}", n), SubmissionStatus::Queued))
    }

    async fn fetch_status(
        &self,
        tracking_id: &str,
        _cancel: &CancellationToken,
    ) -> ocr_pipeline::Result<SubmissionResponse> {
        Ok(SubmissionResponse::new(tracking_id, SubmissionStatus::Complete))
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocr_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    tracing::info!("Configuration loaded");
    tracing::info!("  - Retry attempts: {}", config.retry.max_attempts);
    tracing::info!("  - Cache TTL: {} minutes", config.cache.default_ttl_minutes);
    tracing::info!("  - Retry queue batch: {}", config.retry_queue.batch_size);

    let registry = Arc::new(ProcessorRegistry::new());
    registry.register(
        Arc::new(PlainTextProcessor),
        Some(ProcessorInfo::for_type("plain-text").with_extensions(["txt"])),
    )?;
    registry.register(
        Arc::new(ImageProcessor),
        Some(
            ProcessorInfo::for_type("image")
                .with_priority(10)
                .with_extensions(["jpg", "png"]),
        ),
    )?;

    let cache = Arc::new(ResultCache::new(
        Arc::new(InMemoryByteStore::new()),
        Arc::new(Sha256Hasher),
        &config.cache,
    ));

    let connectivity = Arc::new(ManualConnectivity::new(false));
    let client = Arc::new(LoopbackClient {
        submissions: AtomicU32::new(0),
    });
    let retry_queue = Arc::new(RetryQueueProcessor::new(
        Arc::new(InMemoryFailedRequestStore::new()),
        connectivity.clone(),
        OcrFlow::new(client.clone(), RetryPolicy::new(config.retry.clone())?),
        config.retry_queue.clone(),
    ));
    retry_queue.start_monitoring().await?;

    let queue = Arc::new(ProcessingQueue::new(&config.queue));
    queue.start().await?;

    let policy = RetryPolicy::new(config.retry.clone())?;
    let worker = QueueWorker::new(queue.clone(), registry.clone(), policy, config.worker.clone())
        .with_cache(cache.clone())
        .with_retry_queue(retry_queue.clone());

    let cancel = CancellationToken::new();
    let token = CancellationToken::new();
    for (data, priority) in [
        (b"hello from the pipeline".to_vec(), JobPriority::Normal),
        (b"urgent memo".to_vec(), JobPriority::Critical),
        (b"hello from the pipeline".to_vec(), JobPriority::Low),
        (vec![0xFF, 0xD8, 0xFF, 0xE0], JobPriority::High),
    ] {
        queue
            .enqueue(DocumentRequest::auto_detect(data), priority, None, &token)
            .await?;
    }

    let worker_token = cancel.child_token();
    let worker_task = tokio::spawn(async move { worker.run(&worker_token).await });

    while queue.count(JobStatus::Queued).await? + queue.count(JobStatus::Processing).await? > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("\nJobs:");
    for job in queue.jobs(None).await? {
        println!(
            "  {} {:?} {:?} {}",
            job.id,
            job.priority,
            job.status,
            job.error_message.unwrap_or_default()
        );
    }

    tracing::info!("Bringing connectivity online");
    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = queue.statistics().await?;
    let cache_stats = cache.statistics(&token).await?;
    let retry_status = retry_queue.get_status().await?;
    println!("\nQueue: {}", serde_json::to_string_pretty(&stats)?);
    println!("Cache: {}", serde_json::to_string_pretty(&cache_stats)?);
    println!("Retry queue: {}", serde_json::to_string_pretty(&retry_status)?);
    println!("Resubmissions: {}", client.submissions.load(Ordering::SeqCst));

    cancel.cancel();
    worker_task.await??;
    retry_queue.dispose().await;
    queue.dispose().await;
    Ok(())
}
