//! Job queue, notifications and the worker that drains it

mod events;
mod job;
mod processing_queue;
mod worker;

pub use events::{EventHub, QueueEvent};
pub use job::{DocumentRequest, JobPriority, JobStatus, QueueState, QueuedJob, StatusUpdate};
pub use processing_queue::{ProcessingQueue, QueueStatistics};
pub use worker::{JobOutcome, QueueWorker};
