//! Queue notifications delivered to every subscriber

use serde::Serialize;
use tokio::sync::broadcast;

use super::job::{JobPriority, JobStatus, QueueState, QueuedJob};

/// Notification raised by the processing queue
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Queue-level state transition
    StateChanged {
        previous: QueueState,
        current: QueueState,
    },
    /// A job entered the queue
    JobQueued {
        job_id: String,
        priority: JobPriority,
        position: usize,
    },
    /// A job changed status
    JobStatusChanged {
        job_id: String,
        previous: JobStatus,
        current: JobStatus,
    },
    /// A job reached its final state (or was removed)
    JobCompleted { job: Box<QueuedJob> },
}

/// Fan-out hub for queue notifications
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver to all current subscribers; no subscribers is not an error
    pub fn publish(&self, event: QueueEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Queue event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}
