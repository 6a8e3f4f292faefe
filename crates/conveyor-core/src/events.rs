//! Typed lifecycle event surface.
//!
//! A closed enum over a broadcast channel, consumed by external
//! logging/metrics listeners. The worker never requires a subscriber to be
//! present; emission is best-effort.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::QueueError;
use crate::job::Job;

/// Every event the worker can emit, with its payload.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job entered the handler.
    Active { job: Job },

    /// Handler finished successfully.
    Completed { job: Job, duration: Duration },

    /// Handler failed.
    Failed {
        job: Job,
        error: QueueError,
        duration: Duration,
    },

    /// Informational: the failed job still has attempts remaining and its
    /// error is retryable. The actual retry decision lives in the provider's
    /// nack logic. Note the final failing attempt emits `Failed` only, never
    /// this event: every emission corresponds to a retry that will happen.
    JobRetrying { job: Job, error: QueueError },

    /// A provider operation (fetch/ack/nack/process) failed.
    QueueError { error: QueueError },

    /// The queue went from non-empty to empty. Edge-triggered, never
    /// repeated on every empty poll.
    QueueDrained,

    /// Graceful shutdown started.
    ShuttingDown,

    /// Jobs were still active past the close deadline. Non-fatal,
    /// observability only.
    ShutdownTimeout { active_jobs: usize },
}

impl QueueEvent {
    /// Stable event name, matching the wire-level names listeners key on.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Active { .. } => "active",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::JobRetrying { .. } => "job.retrying",
            QueueEvent::QueueError { .. } => "queue.error",
            QueueEvent::QueueDrained => "queue.drained",
            QueueEvent::ShuttingDown => "processor.shutting_down",
            QueueEvent::ShutdownTimeout { .. } => "processor.shutdown_timeout",
        }
    }
}

/// Broadcast bus for [`QueueEvent`].
///
/// Slow subscribers lag and drop old events rather than blocking the worker.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

const EVENT_CAPACITY: usize = 256;

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Emit to all current subscribers. A bus with no subscribers is fine.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
