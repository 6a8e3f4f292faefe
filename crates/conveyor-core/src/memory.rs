//! In-memory provider: the reference pull-model implementation.
//!
//! [`MemoryBackend`] is shared multi-queue storage; [`MemoryProvider`] is
//! the queue-scoped wrapper a worker consumes. All storage lives under one
//! `std::sync::Mutex`, and every critical section is await-free, so
//! selection-and-mutation in `fetch` is atomic under real parallelism, not
//! just cooperative scheduling.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::job::{ActiveJob, Job, JobOptions, JobStatus};
use crate::provider::{
    Provider, ProviderCapabilities, ProviderFactory, PullProvider,
};

/// Delayed entry for the per-queue min-heap.
///
/// Reverse ordering so `BinaryHeap` pops the earliest due time first. One
/// heap per queue replaces per-job timers; due entries are promoted lazily
/// during `fetch`, so queue deletion has no timers to cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    due: DateTime<Utc>,
    job_id: String,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

/// Live counts plus running totals for one queue.
///
/// `completed`/`failed` are running totals: acked and terminally failed jobs
/// are usually deleted, so the live map alone cannot account for them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Backend-level health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub queues: usize,
    pub jobs: usize,
}

/// Per-queue storage. The job map is the single source of truth; the heap
/// holds (due, id) pairs only.
struct QueueState {
    jobs: HashMap<String, Job>,
    options: HashMap<String, JobOptions>,
    delayed: BinaryHeap<DelayedEntry>,
    paused: bool,

    /// Single-flight guard: a long-poll park releases the lock, and any
    /// fetch overlapping that window returns empty instead of racing.
    fetch_in_flight: bool,

    completed_total: u64,
    failed_total: u64,

    /// Wakes parked long-poll fetches on add/requeue/resume/removal.
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            options: HashMap::new(),
            delayed: BinaryHeap::new(),
            paused: false,
            fetch_in_flight: false,
            completed_total: 0,
            failed_total: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Move due delayed jobs back to Waiting.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.due > now {
                break; // heap is sorted, nothing further is due
            }
            let entry = self.delayed.pop().expect("peeked entry");
            if let Some(job) = self.jobs.get_mut(&entry.job_id) {
                if job.status == JobStatus::Delayed {
                    job.status = JobStatus::Waiting;
                }
            }
        }
    }

    /// Select up to `count` ready jobs in (priority desc, created_at asc)
    /// order and flip them Active. No suspension point: callers hold the
    /// state lock for the whole selection-and-mutation.
    fn claim_ready(&mut self, count: usize, now: DateTime<Utc>) -> Vec<Job> {
        self.promote_due(now);

        let mut ready: Vec<(i64, DateTime<Utc>, String)> = self
            .jobs
            .values()
            .filter(|job| job.is_ready(now))
            .map(|job| {
                // jobs without a priority sort last
                let rank = job.priority.map_or(i64::MIN, i64::from);
                (rank, job.created_at, job.id.clone())
            })
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut claimed = Vec::new();
        for (_, _, id) in ready.into_iter().take(count) {
            let job = self.jobs.get_mut(&id).expect("selected job exists");
            job.status = JobStatus::Active;
            job.processed_at = Some(now);
            claimed.push(job.clone());
        }
        claimed
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            completed: self.completed_total,
            failed: self.failed_total,
            ..QueueStats::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        stats
    }
}

struct BackendState {
    connected: bool,
    queues: HashMap<String, QueueState>,
}

/// Shared multi-queue in-memory storage.
///
/// Cheap to clone; all clones share the same state. Bind it to one queue
/// with [`MemoryBackend::provider_for`] to get a worker-consumable provider.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                connected: false,
                queues: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().expect("memory backend lock poisoned")
    }

    /// Store a job with default retention options.
    pub fn add(&self, job: Job) -> Result<Job, QueueError> {
        self.add_with_options(job, JobOptions::default())
    }

    /// Store a job. A duplicate id within the queue is a no-op returning the
    /// stored job unchanged. A future `scheduled_for` stores the job Delayed
    /// and registers it on the delay heap.
    pub fn add_with_options(&self, mut job: Job, options: JobOptions) -> Result<Job, QueueError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .entry(job.queue_name.clone())
            .or_insert_with(QueueState::new);

        if let Some(existing) = queue.jobs.get(&job.id) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        match job.scheduled_for {
            Some(due) if due > now => {
                job.status = JobStatus::Delayed;
                queue.delayed.push(DelayedEntry {
                    due,
                    job_id: job.id.clone(),
                });
            }
            _ => job.status = JobStatus::Waiting,
        }

        queue.options.insert(job.id.clone(), options);
        queue.jobs.insert(job.id.clone(), job.clone());
        queue.notify.notify_one();
        Ok(job)
    }

    /// Stop handing out jobs from `queue_name`. Idempotent; creates the
    /// queue if absent.
    pub fn pause(&self, queue_name: &str) {
        let mut state = self.lock();
        let queue = state
            .queues
            .entry(queue_name.to_string())
            .or_insert_with(QueueState::new);
        queue.paused = true;
    }

    /// Resume a paused queue. Idempotent; creates the queue if absent.
    pub fn resume(&self, queue_name: &str) {
        let mut state = self.lock();
        let queue = state
            .queues
            .entry(queue_name.to_string())
            .or_insert_with(QueueState::new);
        queue.paused = false;
        queue.notify.notify_one();
    }

    pub fn stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        let queue = state
            .queues
            .get(queue_name)
            .ok_or_else(|| QueueError::not_found(format!("queue {queue_name} not found")))?;
        Ok(queue.stats())
    }

    pub fn health(&self) -> HealthStatus {
        let state = self.lock();
        HealthStatus {
            healthy: state.connected,
            queues: state.queues.len(),
            jobs: state.queues.values().map(|q| q.jobs.len()).sum(),
        }
    }

    /// Drop a queue and wake any parked fetch so it observes the removal.
    pub fn remove_queue(&self, queue_name: &str) {
        let mut state = self.lock();
        if let Some(queue) = state.queues.remove(queue_name) {
            queue.notify.notify_waiters();
        }
    }

    fn connect(&self) {
        self.lock().connected = true;
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        state.queues.clear();
    }

    async fn fetch(
        &self,
        queue_name: &str,
        count: usize,
        wait: Option<Duration>,
    ) -> Result<Vec<ActiveJob>, QueueError> {
        let now = Utc::now();
        let (notify, wait) = {
            let mut state = self.lock();
            if !state.connected {
                return Err(QueueError::connection("memory provider is not connected"));
            }
            let queue = state
                .queues
                .entry(queue_name.to_string())
                .or_insert_with(QueueState::new);

            if queue.paused || queue.fetch_in_flight {
                return Ok(Vec::new());
            }

            let claimed = queue.claim_ready(count, now);
            if !claimed.is_empty() {
                return Ok(claimed.into_iter().map(ActiveJob::new).collect());
            }
            let Some(wait) = wait else {
                return Ok(Vec::new());
            };

            queue.fetch_in_flight = true;
            (queue.notify.clone(), wait)
        };

        // Clears the single-flight flag even if this future is cancelled
        // mid-park.
        let _flag = FetchFlagGuard {
            backend: self,
            queue_name,
        };

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }

        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Ok(Vec::new()); // queue removed while parked
        };
        if queue.paused {
            return Ok(Vec::new());
        }
        let claimed = queue.claim_ready(count, Utc::now());
        Ok(claimed.into_iter().map(ActiveJob::new).collect())
    }

    fn ack(&self, queue_name: &str, job: &ActiveJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::not_found(format!("queue {queue_name} not found")))?;
        let id = &job.job.id;
        let stored = queue
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(format!("job {id} not found")))?;

        stored.status = JobStatus::Completed;
        stored.completed_at = Some(Utc::now());
        queue.completed_total += 1;

        let options = queue.options.get(id).copied().unwrap_or_default();
        if options.remove_on_complete {
            queue.jobs.remove(id);
            queue.options.remove(id);
        }
        Ok(())
    }

    fn nack(
        &self,
        queue_name: &str,
        job: &ActiveJob,
        error: &QueueError,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::not_found(format!("queue {queue_name} not found")))?;
        let id = &job.job.id;
        let stored = queue
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(format!("job {id} not found")))?;

        stored.attempts += 1;
        stored.error = Some(error.to_string());

        // An explicitly non-retryable error short-circuits retry even with
        // attempts remaining.
        if error.retryable && stored.attempts < stored.max_attempts {
            stored.status = JobStatus::Waiting;
            queue.notify.notify_one();
            return Ok(());
        }

        stored.status = JobStatus::Failed;
        stored.failed_at = Some(Utc::now());
        queue.failed_total += 1;

        let options = queue.options.get(id).copied().unwrap_or_default();
        if options.remove_on_fail {
            queue.jobs.remove(id);
            queue.options.remove(id);
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory for MemoryBackend {
    fn provider_for(&self, queue_name: &str) -> Arc<dyn Provider> {
        Arc::new(MemoryProvider {
            backend: self.clone(),
            queue_name: queue_name.to_string(),
        })
    }
}

struct FetchFlagGuard<'a> {
    backend: &'a MemoryBackend,
    queue_name: &'a str,
}

impl Drop for FetchFlagGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.backend.lock();
        if let Some(queue) = state.queues.get_mut(self.queue_name) {
            queue.fetch_in_flight = false;
        }
    }
}

/// [`MemoryBackend`] bound to one queue name; the pull provider a worker
/// consumes.
pub struct MemoryProvider {
    backend: MemoryBackend,
    queue_name: String,
}

impl MemoryProvider {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_long_polling: true,
            supports_delayed_jobs: true,
            supports_priority: true,
            max_batch_size: None,
        }
    }

    async fn connect(&self) -> Result<(), QueueError> {
        self.backend.connect();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        self.backend.disconnect();
        Ok(())
    }

    fn as_pull(self: Arc<Self>) -> Option<Arc<dyn PullProvider>> {
        Some(self)
    }
}

#[async_trait]
impl PullProvider for MemoryProvider {
    async fn fetch(
        &self,
        count: usize,
        wait: Option<Duration>,
    ) -> Result<Vec<ActiveJob>, QueueError> {
        self.backend.fetch(&self.queue_name, count, wait).await
    }

    async fn ack(&self, job: &ActiveJob) -> Result<(), QueueError> {
        self.backend.ack(&self.queue_name, job)
    }

    async fn nack(&self, job: &ActiveJob, error: &QueueError) -> Result<(), QueueError> {
        self.backend.nack(&self.queue_name, job, error)
    }
}
