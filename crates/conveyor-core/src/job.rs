//! Job domain types: status, record, options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Job lifecycle status.
///
/// Transitions are monotonic along
/// `Delayed -> Waiting -> Active -> {Completed | Waiting(retry) | Failed}`.
/// The provider owns every transition; the worker only reports outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Ready to be fetched.
    Waiting,

    /// Claimed by a worker, handler running.
    Active,

    /// Acked successfully.
    Completed,

    /// Permanently failed (attempts exhausted or non-retryable error).
    Failed,

    /// Waiting for its `scheduled_for` time.
    Delayed,
}

impl JobStatus {
    /// Is this a terminal status (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A queued job: metadata plus an opaque payload.
///
/// The provider's storage is the single source of truth for jobs from `add`
/// until removal on ack or terminal failure. Workers only hold transient
/// references while the handler runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique within its queue. A duplicate add is a no-op returning the
    /// stored job.
    pub id: String,

    /// Job type name, used by handlers to dispatch.
    pub name: String,

    /// Queue this job belongs to.
    pub queue_name: String,

    /// Opaque payload; handlers decode as they like.
    pub data: serde_json::Value,

    pub status: JobStatus,

    /// Number of times this job has been nacked. Increases only on nack.
    pub attempts: u32,

    /// Maximum attempts before the job is marked failed.
    pub max_attempts: u32,

    /// Higher runs first. Jobs without a priority sort last.
    pub priority: Option<i32>,

    /// Earliest time the job may run. Set implies the job starts out Delayed.
    pub scheduled_for: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Last error message recorded on nack.
    pub error: Option<String>,
}

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl Job {
    /// Create a job with a generated ULID id, ready to be added to a queue.
    pub fn new(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            name: name.into(),
            queue_name: queue_name.into(),
            data,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: None,
            scheduled_for: None,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }

    /// Override the generated id (needed for idempotent adds).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Schedule the job for a future time. Providers store it as Delayed
    /// until the time elapses.
    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(run_at);
        self
    }

    /// Is the job ready to be fetched at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting
            && self.scheduled_for.map_or(true, |at| at <= now)
    }
}

/// A job claimed for processing (status = Active), optionally carrying
/// provider-specific delivery metadata (e.g. an SQS receipt handle) that the
/// provider needs back on ack/nack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job: Job,

    /// Provider-specific delivery metadata, opaque to the worker.
    pub delivery: Option<serde_json::Value>,
}

impl ActiveJob {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            delivery: None,
        }
    }

    pub fn with_delivery(mut self, delivery: serde_json::Value) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

/// Per-job retention options, consulted by the provider on ack and terminal
/// nack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delete the job on successful ack (default true).
    pub remove_on_complete: bool,

    /// Delete the job on terminal failure (default true).
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }
}
