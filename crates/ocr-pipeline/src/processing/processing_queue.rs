//! Priority queue and state machine for in-flight OCR jobs
//!
//! Jobs live in a single map guarded by an async `RwLock`; lock waits race
//! the caller's cancellation token. Queue positions are recomputed on every
//! mutation that changes the set of `Queued` jobs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use super::events::{EventHub, QueueEvent};
use super::job::{
    DocumentRequest, JobPriority, JobStatus, QueueState, QueuedJob, StatusUpdate,
};
use crate::cancellation;
use crate::config::QueueConfig;
use crate::error::{ensure_id, Error, Result};

const COMPONENT: &str = "ProcessingQueue";

/// Aggregate queue counters
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub total_processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Running average over jobs with a measured duration
    pub average_processing_time_ms: f64,
    pub throughput_per_minute: f64,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct StatsAccumulator {
    total_processed: u64,
    succeeded: u64,
    failed: u64,
    timed_jobs: u64,
    average_processing_time_ms: f64,
    started_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl StatsAccumulator {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            total_processed: 0,
            succeeded: 0,
            failed: 0,
            timed_jobs: 0,
            average_processing_time_ms: 0.0,
            started_at: now,
            last_updated: now,
        }
    }

    fn record(&mut self, status: JobStatus, duration_ms: Option<u64>) {
        match status {
            JobStatus::Completed => {
                self.total_processed += 1;
                self.succeeded += 1;
            }
            JobStatus::Failed => {
                self.total_processed += 1;
                self.failed += 1;
            }
            _ => {}
        }

        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            if let Some(ms) = duration_ms {
                self.timed_jobs += 1;
                self.average_processing_time_ms +=
                    (ms as f64 - self.average_processing_time_ms) / self.timed_jobs as f64;
            }
        }
        self.last_updated = Utc::now();
    }

    fn snapshot(&self) -> QueueStatistics {
        let elapsed_minutes =
            (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 60_000.0;
        let throughput_per_minute = if elapsed_minutes > 0.0 {
            self.total_processed as f64 / elapsed_minutes
        } else {
            0.0
        };

        QueueStatistics {
            total_processed: self.total_processed,
            succeeded: self.succeeded,
            failed: self.failed,
            average_processing_time_ms: self.average_processing_time_ms,
            throughput_per_minute,
            started_at: self.started_at,
            last_updated: self.last_updated,
        }
    }
}

struct QueueInner {
    state: QueueState,
    jobs: HashMap<String, QueuedJob>,
    next_sequence: u64,
    stats: StatsAccumulator,
}

impl QueueInner {
    /// Assign 1-based positions to queued jobs; clear everyone else's
    fn recompute_positions(&mut self) {
        let mut queued: Vec<(_, String)> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| (j.order_key(), j.id.clone()))
            .collect();
        queued.sort();

        for job in self.jobs.values_mut() {
            job.queue_position = None;
        }
        for (index, (_, id)) in queued.into_iter().enumerate() {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.queue_position = Some(index + 1);
            }
        }
    }

    fn sorted_jobs(&self, filter: Option<JobStatus>) -> Vec<&QueuedJob> {
        let mut jobs: Vec<&QueuedJob> = self
            .jobs
            .values()
            .filter(|j| filter.map_or(true, |s| j.status == s))
            .collect();
        jobs.sort_by_key(|j| j.order_key());
        jobs
    }

    fn transition_state(&mut self, next: QueueState, events: &mut Vec<QueueEvent>) {
        let previous = self.state;
        if previous == next {
            return;
        }
        self.state = next;
        tracing::info!("Processing queue state: {:?} -> {:?}", previous, next);
        events.push(QueueEvent::StateChanged {
            previous,
            current: next,
        });
    }

    /// Apply a forward status change, returning the previous status
    fn apply_status(
        &mut self,
        job_id: &str,
        update: StatusUpdate,
        events: &mut Vec<QueueEvent>,
    ) -> Result<Option<JobStatus>> {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return Ok(None);
        };

        let previous = job.status;
        if !previous.can_transition_to(update.status) {
            return Err(Error::invalid_operation(format!(
                "Job {} cannot move from {:?} to {:?}",
                job_id, previous, update.status
            )));
        }

        let now = Utc::now();
        job.status = update.status;
        if update.result.is_some() {
            job.result = update.result;
        }
        if update.error_message.is_some() {
            job.error_message = update.error_message;
        }
        if update.error_code.is_some() {
            job.error_code = update.error_code;
        }
        if update.status == JobStatus::Processing {
            job.started_at = Some(now);
        }

        let terminal = update.status.is_terminal();
        if terminal {
            job.completed_at = Some(now);
            job.processing_time_ms = job
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
        }

        events.push(QueueEvent::JobStatusChanged {
            job_id: job_id.to_string(),
            previous,
            current: update.status,
        });

        let duration = job.processing_time_ms;
        let snapshot = terminal.then(|| job.clone());

        self.recompute_positions();

        if let Some(mut finished) = snapshot {
            self.stats.record(finished.status, duration);
            finished.queue_position = None;
            events.push(QueueEvent::JobCompleted {
                job: Box::new(finished),
            });
        }

        Ok(Some(previous))
    }
}

/// Prioritized job queue with lifecycle state and notifications
pub struct ProcessingQueue {
    inner: RwLock<QueueInner>,
    events: EventHub,
    disposed: AtomicBool,
    default_max_retries: u32,
}

impl ProcessingQueue {
    /// Create a stopped queue
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: RwLock::new(QueueInner {
                state: QueueState::Stopped,
                jobs: HashMap::new(),
                next_sequence: 0,
                stats: StatsAccumulator::new(),
            }),
            events: EventHub::new(config.event_capacity),
            disposed: AtomicBool::new(false),
            default_max_retries: config.default_max_retries,
        }
    }

    /// Receive every queue notification raised from now on
    pub fn subscribe(&self) -> Result<broadcast::Receiver<QueueEvent>> {
        self.ensure_not_disposed()?;
        Ok(self.events.subscribe())
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed(COMPONENT));
        }
        Ok(())
    }

    async fn read(&self) -> Result<RwLockReadGuard<'_, QueueInner>> {
        self.ensure_not_disposed()?;
        Ok(self.inner.read().await)
    }

    async fn write(&self, cancel: &CancellationToken) -> Result<RwLockWriteGuard<'_, QueueInner>> {
        self.ensure_not_disposed()?;
        cancellation::check(cancel)?;
        let guard = cancellation::run_cancellable(cancel, self.inner.write()).await?;
        // Disposal may have happened while waiting for the lock
        self.ensure_not_disposed()?;
        Ok(guard)
    }

    fn publish_all(&self, events: Vec<QueueEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    // ---- queue lifecycle ----

    pub async fn state(&self) -> Result<QueueState> {
        Ok(self.read().await?.state)
    }

    /// `Stopped -> Running`
    pub async fn start(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.write(&CancellationToken::new()).await?;
            match inner.state {
                QueueState::Running => {}
                QueueState::Stopped => inner.transition_state(QueueState::Running, &mut events),
                other => {
                    return Err(Error::invalid_operation(format!(
                        "Cannot start queue while {:?}",
                        other
                    )))
                }
            }
        }
        self.publish_all(events);
        Ok(())
    }

    /// `Running -> Paused`
    pub async fn pause(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.write(&CancellationToken::new()).await?;
            match inner.state {
                QueueState::Paused => {}
                QueueState::Running => inner.transition_state(QueueState::Paused, &mut events),
                other => {
                    return Err(Error::invalid_operation(format!(
                        "Cannot pause queue while {:?}",
                        other
                    )))
                }
            }
        }
        self.publish_all(events);
        Ok(())
    }

    /// `Paused -> Running`
    pub async fn resume(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.write(&CancellationToken::new()).await?;
            match inner.state {
                QueueState::Running => {}
                QueueState::Paused => inner.transition_state(QueueState::Running, &mut events),
                other => {
                    return Err(Error::invalid_operation(format!(
                        "Cannot resume queue while {:?}",
                        other
                    )))
                }
            }
        }
        self.publish_all(events);
        Ok(())
    }

    /// `Running | Paused -> Stopping -> Stopped`
    pub async fn stop(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.write(&CancellationToken::new()).await?;
            if matches!(inner.state, QueueState::Running | QueueState::Paused) {
                inner.transition_state(QueueState::Stopping, &mut events);
                inner.transition_state(QueueState::Stopped, &mut events);
            }
        }
        self.publish_all(events);
        Ok(())
    }

    /// Stop the queue and reject every later call
    pub async fn dispose(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().await;
            if matches!(inner.state, QueueState::Running | QueueState::Paused) {
                inner.transition_state(QueueState::Stopping, &mut events);
                inner.transition_state(QueueState::Stopped, &mut events);
            }
            self.disposed.store(true, Ordering::SeqCst);
        }
        self.publish_all(events);
        tracing::info!("Processing queue disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // ---- job operations ----

    /// Add a document to the queue; returns the new job id
    pub async fn enqueue(
        &self,
        request: DocumentRequest,
        priority: JobPriority,
        metadata: Option<HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.ensure_not_disposed()?;
        request.validate()?;

        let mut events = Vec::new();
        let job_id = {
            let mut inner = self.write(cancel).await?;
            if inner.state != QueueState::Running {
                return Err(Error::invalid_operation(format!(
                    "Cannot enqueue while queue is {:?}",
                    inner.state
                )));
            }

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let job = QueuedJob::new(
                request,
                priority,
                metadata.unwrap_or_default(),
                self.default_max_retries,
                sequence,
            );
            let job_id = job.id.clone();
            inner.jobs.insert(job_id.clone(), job);
            inner.recompute_positions();

            let position = inner
                .jobs
                .get(&job_id)
                .and_then(|j| j.queue_position)
                .unwrap_or_default();
            tracing::info!(
                "Enqueued job {} (priority {:?}, position {})",
                job_id,
                priority,
                position
            );
            events.push(QueueEvent::JobQueued {
                job_id: job_id.clone(),
                priority,
                position,
            });
            job_id
        };

        self.publish_all(events);
        Ok(job_id)
    }

    /// Highest-priority, earliest queued job, if any
    pub async fn next_for_processing(&self) -> Result<Option<QueuedJob>> {
        let inner = self.read().await?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| j.order_key())
            .cloned())
    }

    /// Atomically take the next queued job and mark it `Processing`
    pub async fn claim_next(&self, cancel: &CancellationToken) -> Result<Option<QueuedJob>> {
        let mut events = Vec::new();
        let claimed = {
            let mut inner = self.write(cancel).await?;
            if inner.state != QueueState::Running {
                return Ok(None);
            }
            let next_id = inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued)
                .min_by_key(|j| j.order_key())
                .map(|j| j.id.clone());

            match next_id {
                Some(id) => {
                    inner.apply_status(&id, StatusUpdate::new(JobStatus::Processing), &mut events)?;
                    inner.jobs.get(&id).cloned()
                }
                None => None,
            }
        };
        self.publish_all(events);
        Ok(claimed)
    }

    /// Apply a status change; `false` when the id is unknown
    pub async fn update_status(
        &self,
        job_id: &str,
        update: StatusUpdate,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.ensure_not_disposed()?;
        ensure_id(job_id, "Job id")?;

        let mut events = Vec::new();
        let previous = {
            let mut inner = self.write(cancel).await?;
            inner.apply_status(job_id, update, &mut events)?
        };

        match previous {
            Some(previous) => {
                tracing::debug!("Job {} status updated from {:?}", job_id, previous);
                self.publish_all(events);
                Ok(true)
            }
            None => {
                tracing::debug!("Status update for unknown job {}", job_id);
                Ok(false)
            }
        }
    }

    /// Cancel a queued or processing job; cancelling twice still succeeds
    pub async fn cancel_job(&self, job_id: &str, cancel: &CancellationToken) -> Result<bool> {
        self.ensure_not_disposed()?;
        ensure_id(job_id, "Job id")?;

        let mut events = Vec::new();
        let cancelled = {
            let mut inner = self.write(cancel).await?;
            match inner.jobs.get(job_id).map(|j| j.status) {
                None => false,
                Some(JobStatus::Cancelled) => true,
                Some(status) if status.is_cancellable() => {
                    inner.apply_status(job_id, StatusUpdate::new(JobStatus::Cancelled), &mut events)?;
                    true
                }
                Some(status) => {
                    tracing::debug!("Job {} is {:?} and cannot be cancelled", job_id, status);
                    false
                }
            }
        };

        if cancelled {
            tracing::info!("Cancelled job {}", job_id);
        }
        self.publish_all(events);
        Ok(cancelled)
    }

    /// Move a failed job back to `Queued`, bumping its retry counter.
    ///
    /// The job's `max_retries` is advisory: retries past it are allowed.
    pub async fn retry_job(&self, job_id: &str, cancel: &CancellationToken) -> Result<bool> {
        self.ensure_not_disposed()?;
        ensure_id(job_id, "Job id")?;

        let mut events = Vec::new();
        {
            let mut inner = self.write(cancel).await?;
            let Some(job) = inner.jobs.get_mut(job_id) else {
                return Ok(false);
            };

            if job.status != JobStatus::Failed {
                return Err(Error::invalid_operation(format!(
                    "Only failed jobs can be retried; job {} is {:?}",
                    job_id, job.status
                )));
            }

            job.status = JobStatus::Queued;
            job.retry_count += 1;
            job.error_message = None;
            job.error_code = None;
            job.result = None;
            job.started_at = None;
            job.completed_at = None;
            job.processing_time_ms = None;

            if job.has_exceeded_max_retries() {
                tracing::warn!(
                    "Job {} retried {} times (advisory max {})",
                    job_id,
                    job.retry_count,
                    job.max_retries
                );
            } else {
                tracing::info!("Retrying job {} (attempt {})", job_id, job.retry_count);
            }

            events.push(QueueEvent::JobStatusChanged {
                job_id: job_id.to_string(),
                previous: JobStatus::Failed,
                current: JobStatus::Queued,
            });
            inner.recompute_positions();
        }

        self.publish_all(events);
        Ok(true)
    }

    /// Delete a job, cancelling it first when it is still active
    pub async fn remove_job(&self, job_id: &str, cancel: &CancellationToken) -> Result<bool> {
        self.ensure_not_disposed()?;
        ensure_id(job_id, "Job id")?;

        let mut events = Vec::new();
        {
            let mut inner = self.write(cancel).await?;
            let Some(status) = inner.jobs.get(job_id).map(|j| j.status) else {
                return Ok(false);
            };

            if status.is_cancellable() {
                inner.apply_status(job_id, StatusUpdate::new(JobStatus::Cancelled), &mut events)?;
                // apply_status already announced the final state
            }

            if let Some(mut removed) = inner.jobs.remove(job_id) {
                removed.queue_position = None;
                if !status.is_cancellable() {
                    events.push(QueueEvent::JobCompleted {
                        job: Box::new(removed),
                    });
                }
            }
            inner.recompute_positions();
        }

        tracing::info!("Removed job {}", job_id);
        self.publish_all(events);
        Ok(true)
    }

    /// Drop every completed, failed or cancelled job
    pub async fn clear_completed(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut inner = self.write(cancel).await?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| !job.status.is_terminal());
        let removed = before - inner.jobs.len();

        if removed > 0 {
            tracing::info!("Cleared {} finished jobs", removed);
        }
        Ok(removed)
    }

    // ---- queries ----

    pub async fn statistics(&self) -> Result<QueueStatistics> {
        Ok(self.read().await?.stats.snapshot())
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<QueuedJob>> {
        self.ensure_not_disposed()?;
        ensure_id(job_id, "Job id")?;
        Ok(self.read().await?.jobs.get(job_id).cloned())
    }

    /// Jobs ordered by priority (descending) then enqueue time
    pub async fn jobs(&self, filter: Option<JobStatus>) -> Result<Vec<QueuedJob>> {
        let inner = self.read().await?;
        Ok(inner.sorted_jobs(filter).into_iter().cloned().collect())
    }

    pub async fn count(&self, status: JobStatus) -> Result<usize> {
        let inner = self.read().await?;
        Ok(inner.jobs.values().filter(|j| j.status == status).count())
    }

    pub async fn status_counts(&self) -> Result<HashMap<JobStatus, usize>> {
        let inner = self.read().await?;
        let mut counts = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.read().await?.jobs.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

impl Default for ProcessingQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DocumentRequest {
        DocumentRequest::new(vec![0xFF, 0xD8, 0xFF], "receipt")
    }

    async fn running_queue() -> ProcessingQueue {
        let queue = ProcessingQueue::default();
        queue.start().await.unwrap();
        queue
    }

    async fn enqueue(queue: &ProcessingQueue, priority: JobPriority) -> String {
        queue
            .enqueue(request(), priority, None, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn set_status(queue: &ProcessingQueue, id: &str, status: JobStatus) {
        assert!(queue
            .update_status(id, StatusUpdate::new(status), &CancellationToken::new())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_rejected_unless_running() {
        let queue = ProcessingQueue::default();
        let result = queue
            .enqueue(request(), JobPriority::Normal, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));

        queue.start().await.unwrap();
        queue.pause().await.unwrap();
        let result = queue
            .enqueue(request(), JobPriority::Normal, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let queue = running_queue().await;
        let result = queue
            .enqueue(
                DocumentRequest::auto_detect(Vec::new()),
                JobPriority::Normal,
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_listing_order_and_positions() {
        let queue = running_queue().await;
        let low = enqueue(&queue, JobPriority::Low).await;
        let critical = enqueue(&queue, JobPriority::Critical).await;
        let normal = enqueue(&queue, JobPriority::Normal).await;

        let jobs = queue.jobs(None).await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![critical.as_str(), normal.as_str(), low.as_str()]);

        let positions: Vec<Option<usize>> = jobs.iter().map(|j| j.queue_position).collect();
        assert_eq!(positions, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = running_queue().await;
        let first = enqueue(&queue, JobPriority::High).await;
        let second = enqueue(&queue, JobPriority::High).await;
        let third = enqueue(&queue, JobPriority::High).await;

        let next = queue.next_for_processing().await.unwrap().unwrap();
        assert_eq!(next.id, first);

        let ids: Vec<String> = queue.jobs(None).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_next_ignores_non_queued_jobs() {
        let queue = running_queue().await;
        let critical = enqueue(&queue, JobPriority::Critical).await;
        let low = enqueue(&queue, JobPriority::Low).await;

        set_status(&queue, &critical, JobStatus::Processing).await;
        let next = queue.next_for_processing().await.unwrap().unwrap();
        assert_eq!(next.id, low);
        assert_eq!(next.queue_position, Some(1));

        set_status(&queue, &low, JobStatus::Cancelled).await;
        assert!(queue.next_for_processing().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_next_marks_processing() {
        let queue = running_queue().await;
        let id = enqueue(&queue, JobPriority::Normal).await;

        let claimed = queue.claim_next(&CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());
        assert!(queue.claim_next(&CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_records_result_and_stats() {
        let queue = running_queue().await;
        let ok = enqueue(&queue, JobPriority::Normal).await;
        let bad = enqueue(&queue, JobPriority::Normal).await;
        let token = CancellationToken::new();

        set_status(&queue, &ok, JobStatus::Processing).await;
        queue
            .update_status(&ok, StatusUpdate::completed(serde_json::json!({"total": 12.5})), &token)
            .await
            .unwrap();
        set_status(&queue, &bad, JobStatus::Processing).await;
        queue
            .update_status(&bad, StatusUpdate::failed("blurry", Some("permanent".into())), &token)
            .await
            .unwrap();

        let done = queue.job(&ok).await.unwrap().unwrap();
        assert_eq!(done.result, Some(serde_json::json!({"total": 12.5})));
        assert!(done.processing_time_ms.is_some());
        assert!(done.queue_position.is_none());

        let failed = queue.job(&bad).await.unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("blurry"));
        assert_eq!(failed.error_code.as_deref(), Some("permanent"));

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.average_processing_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_update_status_unknown_and_illegal() {
        let queue = running_queue().await;
        let token = CancellationToken::new();
        assert!(!queue
            .update_status("missing", StatusUpdate::new(JobStatus::Completed), &token)
            .await
            .unwrap());

        let skipped = enqueue(&queue, JobPriority::Normal).await;
        let result = queue
            .update_status(&skipped, StatusUpdate::new(JobStatus::Completed), &token)
            .await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert_eq!(queue.job(&skipped).await.unwrap().unwrap().status, JobStatus::Queued);

        let id = enqueue(&queue, JobPriority::Normal).await;
        set_status(&queue, &id, JobStatus::Processing).await;
        set_status(&queue, &id, JobStatus::Completed).await;
        let result = queue
            .update_status(&id, StatusUpdate::new(JobStatus::Processing), &token)
            .await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let queue = running_queue().await;
        let token = CancellationToken::new();
        let id = enqueue(&queue, JobPriority::Normal).await;

        let result = queue.retry_job(&id, &token).await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));

        set_status(&queue, &id, JobStatus::Processing).await;
        set_status(&queue, &id, JobStatus::Failed).await;
        assert!(queue.retry_job(&id, &token).await.unwrap());

        let job = queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.queue_position, Some(1));
        assert!(!queue.retry_job("unknown", &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_past_max_is_allowed() {
        let queue = ProcessingQueue::new(&QueueConfig {
            default_max_retries: 1,
            ..QueueConfig::default()
        });
        queue.start().await.unwrap();
        let token = CancellationToken::new();
        let id = enqueue(&queue, JobPriority::Normal).await;

        for expected in 1..=3 {
            set_status(&queue, &id, JobStatus::Processing).await;
            set_status(&queue, &id, JobStatus::Failed).await;
            assert!(queue.retry_job(&id, &token).await.unwrap());
            assert_eq!(queue.job(&id).await.unwrap().unwrap().retry_count, expected);
        }
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let queue = running_queue().await;
        let token = CancellationToken::new();
        let id = enqueue(&queue, JobPriority::Normal).await;

        assert!(queue.cancel_job(&id, &token).await.unwrap());
        assert!(queue.cancel_job(&id, &token).await.unwrap());
        assert!(!queue.cancel_job("missing", &token).await.unwrap());
        assert!(matches!(
            queue.cancel_job("  ", &token).await,
            Err(Error::InvalidArgument(_))
        ));

        let done = enqueue(&queue, JobPriority::Normal).await;
        set_status(&queue, &done, JobStatus::Processing).await;
        set_status(&queue, &done, JobStatus::Completed).await;
        assert!(!queue.cancel_job(&done, &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_emits_completion_for_queued_job() {
        let queue = running_queue().await;
        let mut events = queue.subscribe().unwrap();
        let token = CancellationToken::new();
        let id = enqueue(&queue, JobPriority::Normal).await;

        assert!(queue.remove_job(&id, &token).await.unwrap());
        assert!(queue.job(&id).await.unwrap().is_none());
        assert!(!queue.remove_job(&id, &token).await.unwrap());

        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::JobCompleted { job } = event {
                completed = Some(job);
            }
        }
        let completed = completed.expect("completion event");
        assert_eq!(completed.id, id);
        assert_eq!(completed.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_clear_completed() {
        let queue = running_queue().await;
        let token = CancellationToken::new();
        let queued = enqueue(&queue, JobPriority::Normal).await;
        let processing = enqueue(&queue, JobPriority::Normal).await;
        let completed = enqueue(&queue, JobPriority::Normal).await;
        let failed = enqueue(&queue, JobPriority::Normal).await;
        let cancelled = enqueue(&queue, JobPriority::Normal).await;

        for id in [&processing, &completed, &failed] {
            set_status(&queue, id, JobStatus::Processing).await;
        }
        set_status(&queue, &completed, JobStatus::Completed).await;
        set_status(&queue, &failed, JobStatus::Failed).await;
        queue.cancel_job(&cancelled, &token).await.unwrap();

        assert_eq!(queue.clear_completed(&token).await.unwrap(), 3);
        assert_eq!(queue.clear_completed(&token).await.unwrap(), 0);

        let remaining: Vec<String> = queue.jobs(None).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&queued));
        assert!(remaining.contains(&processing));
    }

    #[tokio::test]
    async fn test_state_change_events() {
        let queue = ProcessingQueue::default();
        let mut first = queue.subscribe().unwrap();
        let mut second = queue.subscribe().unwrap();

        queue.start().await.unwrap();
        queue.pause().await.unwrap();
        queue.resume().await.unwrap();
        queue.stop().await.unwrap();

        for receiver in [&mut first, &mut second] {
            let mut transitions = Vec::new();
            while let Ok(QueueEvent::StateChanged { previous, current }) = receiver.try_recv() {
                transitions.push((previous, current));
            }
            assert_eq!(
                transitions,
                vec![
                    (QueueState::Stopped, QueueState::Running),
                    (QueueState::Running, QueueState::Paused),
                    (QueueState::Paused, QueueState::Running),
                    (QueueState::Running, QueueState::Stopping),
                    (QueueState::Stopping, QueueState::Stopped),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_aborts_before_mutation() {
        let queue = running_queue().await;
        let token = CancellationToken::new();
        token.cancel();

        let result = queue.enqueue(request(), JobPriority::High, None, &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_dispose() {
        let queue = running_queue().await;
        let id = enqueue(&queue, JobPriority::Normal).await;
        queue.dispose().await;
        let token = CancellationToken::new();

        assert!(matches!(queue.enqueue(request(), JobPriority::Low, None, &token).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.next_for_processing().await, Err(Error::Disposed(_))));
        assert!(matches!(queue.claim_next(&token).await, Err(Error::Disposed(_))));
        assert!(matches!(
            queue.update_status(&id, StatusUpdate::new(JobStatus::Completed), &token).await,
            Err(Error::Disposed(_))
        ));
        assert!(matches!(queue.cancel_job(&id, &token).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.retry_job(&id, &token).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.remove_job(&id, &token).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.clear_completed(&token).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.statistics().await, Err(Error::Disposed(_))));
        assert!(matches!(queue.jobs(None).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.job(&id).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.count(JobStatus::Queued).await, Err(Error::Disposed(_))));
        assert!(matches!(queue.state().await, Err(Error::Disposed(_))));
        assert!(matches!(queue.start().await, Err(Error::Disposed(_))));
        assert!(matches!(queue.subscribe(), Err(Error::Disposed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_assigns_unique_positions() {
        let queue = running_queue().await;
        let token = CancellationToken::new();
        let results = futures::future::join_all(
            (0..20).map(|_| queue.enqueue(request(), JobPriority::Normal, None, &token)),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let mut positions: Vec<usize> = queue
            .jobs(Some(JobStatus::Queued))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|j| j.queue_position)
            .collect();
        positions.sort_unstable();
        assert_eq!(positions, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let queue = running_queue().await;
        let a = enqueue(&queue, JobPriority::Normal).await;
        enqueue(&queue, JobPriority::Normal).await;
        set_status(&queue, &a, JobStatus::Processing).await;

        let counts = queue.status_counts().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Queued), Some(&1));
        assert_eq!(counts.get(&JobStatus::Processing), Some(&1));
        assert_eq!(queue.count(JobStatus::Completed).await.unwrap(), 0);
    }
}
