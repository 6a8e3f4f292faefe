//! Worker: detects the provider's delivery model, instruments handler
//! execution, and owns concurrency/backpressure for pull providers.
//!
//! Push providers run their own loop; the worker only wraps the handler and
//! keeps the shutdown handle. Pull providers get a semaphore-gated fetch
//! loop: permits bound in-flight jobs, spawned tasks are collected in a
//! `JoinSet` and joined (or detached) on shutdown. The worker never cancels
//! handler execution; shutdown only bounds how long `close` waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::Job;
use crate::provider::{
    JobHandler, ProcessOptions, Provider, ProviderCapabilities, PullProvider, PushProvider,
    ShutdownHandle,
};

/// Worker tuning. `poll_interval` and `error_backoff` are required and must
/// be non-zero, validated at construction: a zero poll interval is a
/// busy-spin loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no capacity or no work; doubles as the
    /// long-polling wait hint for providers that support it.
    pub poll_interval: Duration,

    /// Sleep after a failed fetch, tuned independently of `poll_interval`.
    pub error_backoff: Duration,

    /// Maximum jobs in flight (default 1).
    pub concurrency: usize,

    /// Maximum jobs requested per fetch (default 1); never more than the
    /// free concurrency slots.
    pub batch_size: usize,
}

impl WorkerConfig {
    pub fn new(poll_interval: Duration, error_backoff: Duration) -> Self {
        Self {
            poll_interval,
            error_backoff,
            concurrency: 1,
            batch_size: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn validate(&self) -> Result<(), QueueError> {
        if self.poll_interval.is_zero() {
            return Err(QueueError::configuration("poll_interval must be non-zero"));
        }
        if self.error_backoff.is_zero() {
            return Err(QueueError::configuration("error_backoff must be non-zero"));
        }
        if self.concurrency == 0 {
            return Err(QueueError::configuration("concurrency must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(QueueError::configuration("batch_size must be at least 1"));
        }
        Ok(())
    }
}

/// Options for [`Worker::close`].
#[derive(Debug, Clone)]
pub struct CloseOptions {
    /// Upper bound on waiting for in-flight jobs (default 30 s).
    pub timeout: Duration,

    /// Wait for in-flight jobs before returning (default true). When false,
    /// `close` returns promptly and in-flight jobs finish in the background.
    pub finish_active_jobs: bool,

    /// Also disconnect the provider (default false; the provider may be
    /// shared with other workers).
    pub disconnect_provider: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            finish_active_jobs: true,
            disconnect_provider: false,
        }
    }
}

/// Worker lifecycle. `start` is only valid from `Idle`; `close` is a no-op
/// unless `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Shutdown signal for the pull loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    Run,
    /// Stop fetching, join in-flight tasks.
    Drain,
    /// Stop fetching, detach in-flight tasks; they ack/nack on their own.
    Detach,
}

/// Shared instrumentation around one handler invocation, used by both
/// delivery models.
struct JobExecutor {
    handler: Arc<dyn JobHandler>,
    events: EventBus,
    active: Arc<AtomicUsize>,
}

impl JobExecutor {
    /// Run the handler for one job, bracketed by the active gauge and the
    /// lifecycle events. The error is returned structurally, never
    /// flattened: push providers need it for their own retry bookkeeping,
    /// pull-mode tasks feed it to nack.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, QueueError> {
        let _active = ActiveGuard::new(Arc::clone(&self.active));
        let started = Instant::now();

        self.events.emit(QueueEvent::Active { job: job.clone() });
        tracing::debug!(job_id = %job.id, queue = %job.queue_name, "job active");

        let result = self.handler.handle(&job.data, job).await;
        let duration = started.elapsed();

        match result {
            Ok(value) => {
                tracing::debug!(job_id = %job.id, ?duration, "job completed");
                self.events.emit(QueueEvent::Completed {
                    job: job.clone(),
                    duration,
                });
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(job_id = %job.id, error = %error, ?duration, "job failed");
                self.events.emit(QueueEvent::Failed {
                    job: job.clone(),
                    error: error.clone(),
                    duration,
                });
                // informational; the provider's nack logic makes the actual
                // retry decision with the same inputs
                if error.retryable && job.attempts + 1 < job.max_attempts {
                    self.events.emit(QueueEvent::JobRetrying {
                        job: job.clone(),
                        error: error.clone(),
                    });
                }
                Err(error)
            }
        }
    }
}

/// Increments the in-flight gauge for its lifetime. Dropped on every exit
/// path, so the gauge cannot leak and never goes negative.
struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The wrapped handler handed to push providers: same instrumentation as
/// pull mode, same structural error back to the provider.
struct InstrumentedHandler {
    executor: Arc<JobExecutor>,
}

#[async_trait]
impl JobHandler for InstrumentedHandler {
    async fn handle(
        &self,
        _data: &serde_json::Value,
        job: &Job,
    ) -> Result<serde_json::Value, QueueError> {
        self.executor.execute(job).await
    }
}

/// Provider-agnostic job consumer. One worker drives one queue-scoped
/// provider; the event surface is per worker.
pub struct Worker {
    provider: Arc<dyn Provider>,
    executor: Arc<JobExecutor>,
    config: WorkerConfig,
    events: EventBus,
    active: Arc<AtomicUsize>,
    state: WorkerState,
    shutdown_tx: Option<watch::Sender<ShutdownMode>>,
    loop_handle: Option<JoinHandle<()>>,
    push_shutdown: Option<ShutdownHandle>,
}

impl Worker {
    /// Fails synchronously with a configuration error on invalid options.
    pub fn new(
        provider: Arc<dyn Provider>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let events = EventBus::new();
        let active = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(JobExecutor {
            handler,
            events: events.clone(),
            active: Arc::clone(&active),
        });
        Ok(Self {
            provider,
            executor,
            config,
            events,
            active,
            state: WorkerState::Idle,
            shutdown_tx: None,
            loop_handle: None,
            push_shutdown: None,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Jobs currently inside the handler. Bounded by `concurrency` in pull
    /// mode; in push mode the provider enforces the bound.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Subscribe to the lifecycle event surface.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Detect the provider's delivery model and begin processing. Push if
    /// the provider processes jobs itself, else pull; a provider exposing
    /// neither is a configuration error.
    pub async fn start(&mut self) -> Result<(), QueueError> {
        if self.state != WorkerState::Idle {
            return Err(QueueError::configuration("worker already started"));
        }

        self.provider.connect().await?;

        if let Some(push) = Arc::clone(&self.provider).as_push() {
            let events = self.events.clone();
            let opts = ProcessOptions {
                concurrency: self.config.concurrency,
                on_error: Arc::new(move |error| {
                    events.emit(QueueEvent::QueueError { error });
                }),
            };
            let handler: Arc<dyn JobHandler> = Arc::new(InstrumentedHandler {
                executor: Arc::clone(&self.executor),
            });
            let handle = push.process(handler, opts).await?;
            self.push_shutdown = Some(handle);
            tracing::info!(concurrency = self.config.concurrency, "worker started (push)");
        } else if let Some(pull) = Arc::clone(&self.provider).as_pull() {
            let (tx, rx) = watch::channel(ShutdownMode::Run);
            let capabilities = self.provider.capabilities();
            let run = PullLoop {
                provider: pull,
                executor: Arc::clone(&self.executor),
                events: self.events.clone(),
                config: self.config.clone(),
                capabilities,
            };
            self.loop_handle = Some(tokio::spawn(run.run(rx)));
            self.shutdown_tx = Some(tx);
            tracing::info!(
                concurrency = self.config.concurrency,
                batch_size = self.config.batch_size,
                "worker started (pull)"
            );
        } else {
            return Err(QueueError::configuration(
                "provider implements neither push nor pull delivery",
            ));
        }

        self.state = WorkerState::Running;
        Ok(())
    }

    /// Graceful shutdown. Stops new fetch/process activity, waits for
    /// in-flight jobs up to `timeout` (unless `finish_active_jobs` is
    /// false), invokes the push provider's shutdown handle if present, and
    /// optionally disconnects the provider. Handler execution is never
    /// cancelled: jobs the close stops waiting for run to completion and
    /// ack/nack on their own. Jobs still active past the deadline only
    /// produce a `processor.shutdown_timeout` event.
    pub async fn close(&mut self, opts: CloseOptions) -> Result<(), QueueError> {
        if self.state != WorkerState::Running {
            return Ok(());
        }
        self.state = WorkerState::ShuttingDown;
        self.events.emit(QueueEvent::ShuttingDown);
        tracing::info!(finish_active_jobs = opts.finish_active_jobs, "worker shutting down");

        if let Some(tx) = self.shutdown_tx.take() {
            let mode = if opts.finish_active_jobs {
                ShutdownMode::Drain
            } else {
                ShutdownMode::Detach
            };
            let _ = tx.send(mode);

            if let Some(mut handle) = self.loop_handle.take() {
                if tokio::time::timeout(opts.timeout, &mut handle).await.is_err() {
                    let active_jobs = self.active_jobs();
                    self.events.emit(QueueEvent::ShutdownTimeout { active_jobs });
                    tracing::warn!(active_jobs, "jobs still active past close deadline");
                    // the detached loop finishes whenever the jobs do
                }
            }
        }

        if let Some(handle) = self.push_shutdown.take() {
            if let Err(error) = handle.shutdown().await {
                tracing::warn!(error = %error, "push provider shutdown failed");
                self.events.emit(QueueEvent::QueueError { error });
            }
        }

        let disconnect = if opts.disconnect_provider {
            self.provider.disconnect().await
        } else {
            Ok(())
        };

        self.state = WorkerState::Stopped;
        tracing::info!("worker stopped");
        disconnect
    }
}

/// The pull-mode fetch loop.
struct PullLoop {
    provider: Arc<dyn PullProvider>,
    executor: Arc<JobExecutor>,
    events: EventBus,
    config: WorkerConfig,
    capabilities: ProviderCapabilities,
}

impl PullLoop {
    async fn run(self, mut shutdown_rx: watch::Receiver<ShutdownMode>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let long_polling = self.capabilities.supports_long_polling;

        // drained is edge-triggered: only a non-empty -> empty transition
        let mut had_jobs = false;

        loop {
            if *shutdown_rx.borrow() != ShutdownMode::Run {
                break;
            }

            self.reap_finished(&mut tasks);

            let available = semaphore.available_permits();
            if available == 0 {
                self.sleep_or_shutdown(self.config.poll_interval, &mut shutdown_rx)
                    .await;
                continue;
            }

            let mut batch = self.config.batch_size.min(available);
            if let Some(max) = self.capabilities.max_batch_size {
                batch = batch.min(max);
            }
            let wait = if long_polling {
                Some(self.config.poll_interval)
            } else {
                None
            };

            let fetch_started = Instant::now();
            let fetched = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                fetched = self.provider.fetch(batch, wait) => fetched,
            };

            match fetched {
                Err(error) => {
                    tracing::warn!(error = %error, "fetch failed, backing off");
                    self.events.emit(QueueEvent::QueueError { error });
                    self.sleep_or_shutdown(self.config.error_backoff, &mut shutdown_rx)
                        .await;
                }
                Ok(jobs) if jobs.is_empty() => {
                    if had_jobs {
                        had_jobs = false;
                        self.events.emit(QueueEvent::QueueDrained);
                        tracing::debug!("queue drained");
                    }
                    // a long poll that returned early (paused queue,
                    // overlapping fetch) must not turn into a zero-delay spin
                    if !long_polling || fetch_started.elapsed() < self.config.poll_interval {
                        self.sleep_or_shutdown(self.config.poll_interval, &mut shutdown_rx)
                            .await;
                    }
                }
                Ok(jobs) => {
                    had_jobs = true;
                    for job in jobs {
                        // never blocks: batch was sized to the free permits
                        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                            break;
                        };
                        let executor = Arc::clone(&self.executor);
                        let provider = Arc::clone(&self.provider);
                        let events = self.events.clone();
                        tasks.spawn(async move {
                            let outcome = match executor.execute(&job.job).await {
                                Ok(_) => provider.ack(&job).await,
                                Err(error) => provider.nack(&job, &error).await,
                            };
                            if let Err(error) = outcome {
                                tracing::warn!(
                                    job_id = %job.job.id,
                                    error = %error,
                                    "ack/nack failed"
                                );
                                events.emit(QueueEvent::QueueError { error });
                            }
                            drop(permit);
                        });
                    }
                }
            }
        }

        if *shutdown_rx.borrow() == ShutdownMode::Detach {
            // in-flight tasks keep running and ack/nack on their own
            tasks.detach_all();
            return;
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                self.events.emit(QueueEvent::QueueError {
                    error: QueueError::processing(format!("job task panicked: {err}")),
                });
            }
        }
    }

    /// Collect finished tasks and surface panics as `queue.error`; panics
    /// stay confined to their task, the loop itself has no failure path.
    fn reap_finished(&self, tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(err) = joined {
                tracing::error!(error = %err, "job task panicked");
                self.events.emit(QueueEvent::QueueError {
                    error: QueueError::processing(format!("job task panicked: {err}")),
                });
            }
        }
    }

    async fn sleep_or_shutdown(
        &self,
        duration: Duration,
        shutdown_rx: &mut watch::Receiver<ShutdownMode>,
    ) {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::job::ActiveJob;
    use crate::memory::MemoryBackend;
    use crate::provider::ProviderFactory;
    use rstest::rstest;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// Handler that sleeps, fails a configurable number of times, and
    /// records its own concurrency high-water mark.
    struct TestHandler {
        delay: Duration,
        remaining_failures: AtomicU32,
        calls: AtomicU32,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl TestHandler {
        fn new(delay: Duration, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                delay,
                remaining_failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        async fn handle(
            &self,
            _data: &serde_json::Value,
            _job: &Job,
        ) -> Result<serde_json::Value, QueueError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);

            let left = self.remaining_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::processing(format!("intentional failure ({left} left)")));
            }
            Ok(serde_json::json!("done"))
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    fn pull_setup(queue: &str) -> (MemoryBackend, Arc<dyn Provider>) {
        let backend = MemoryBackend::new();
        let provider = backend.provider_for(queue);
        (backend, provider)
    }

    async fn wait_until(mut check: impl FnMut() -> bool, deadline: Duration) {
        let started = Instant::now();
        while !check() {
            assert!(started.elapsed() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[rstest]
    #[case(WorkerConfig::new(Duration::ZERO, Duration::from_millis(100)))]
    #[case(WorkerConfig::new(Duration::from_millis(10), Duration::ZERO))]
    #[case(config().with_concurrency(0))]
    #[case(config().with_batch_size(0))]
    fn invalid_config_is_rejected_at_construction(#[case] bad: WorkerConfig) {
        let (_backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::ZERO, 0);
        let err = Worker::new(provider, handler, bad).err().unwrap();
        assert_eq!(err.code, ErrorCode::Configuration);
    }

    struct NoModelProvider;

    #[async_trait]
    impl Provider for NoModelProvider {
        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }
        async fn connect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_fails_fast_without_a_delivery_model() {
        let handler = TestHandler::new(Duration::ZERO, 0);
        let mut worker = Worker::new(Arc::new(NoModelProvider), handler, config()).unwrap();
        let err = worker.start().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Configuration);
    }

    #[tokio::test]
    async fn pull_worker_processes_jobs_and_emits_lifecycle_events() {
        let (backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::from_millis(5), 0);
        let mut worker = Worker::new(
            provider,
            handler.clone(),
            config().with_concurrency(2).with_batch_size(2),
        )
        .unwrap();
        let mut rx = worker.subscribe();

        backend.add(Job::new("a", "q", serde_json::json!({}))).unwrap();
        backend.add(Job::new("b", "q", serde_json::json!({}))).unwrap();

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        wait_until(
            || handler.calls.load(Ordering::SeqCst) == 2,
            Duration::from_secs(2),
        )
        .await;
        // let the loop observe the empty queue
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.close(CloseOptions::default()).await.unwrap();

        let events = drain_events(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "active").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "completed").count(), 2);
        assert_eq!(
            names.iter().filter(|n| **n == "queue.drained").count(),
            1,
            "drained must fire exactly once per empty transition"
        );
        assert!(names.contains(&"processor.shutting_down"));

        assert_eq!(worker.active_jobs(), 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(backend.stats("q").unwrap().completed, 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_dispatch_happens_in_waves() {
        let (backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::from_millis(50), 0);
        let mut worker = Worker::new(
            provider,
            handler.clone(),
            config().with_concurrency(2).with_batch_size(2),
        )
        .unwrap();

        for name in ["a", "b", "c"] {
            backend.add(Job::new(name, "q", serde_json::json!({}))).unwrap();
        }

        let started = Instant::now();
        worker.start().await.unwrap();
        wait_until(
            || handler.calls.load(Ordering::SeqCst) == 3,
            Duration::from_secs(2),
        )
        .await;
        let elapsed = started.elapsed();
        worker.close(CloseOptions::default()).await.unwrap();

        assert!(handler.max_concurrent.load(Ordering::SeqCst) <= 2);
        assert!(
            elapsed >= Duration::from_millis(75),
            "three 50ms jobs at concurrency 2 need two waves, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn failed_job_is_retried_until_success() {
        let (backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::from_millis(1), 1);
        let mut worker = Worker::new(provider, handler.clone(), config()).unwrap();
        let mut rx = worker.subscribe();

        backend
            .add(Job::new("flaky", "q", serde_json::json!({})).with_max_attempts(3))
            .unwrap();

        worker.start().await.unwrap();
        wait_until(
            || backend.stats("q").map(|s| s.completed == 1).unwrap_or(false),
            Duration::from_secs(2),
        )
        .await;
        worker.close(CloseOptions::default()).await.unwrap();

        let names: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.name()).collect::<Vec<_>>();
        assert!(names.contains(&"failed"));
        assert!(names.contains(&"job.retrying"));
        assert!(names.contains(&"completed"));
    }

    /// Pull provider whose first fetch fails, recording fetch times.
    struct FlakyFetchProvider {
        failed_once: AtomicBool,
        fetch_times: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Provider for FlakyFetchProvider {
        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }
        async fn connect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        fn as_pull(self: Arc<Self>) -> Option<Arc<dyn PullProvider>> {
            Some(self)
        }
    }

    #[async_trait]
    impl PullProvider for FlakyFetchProvider {
        async fn fetch(
            &self,
            _count: usize,
            _wait: Option<Duration>,
        ) -> Result<Vec<ActiveJob>, QueueError> {
            self.fetch_times.lock().unwrap().push(Instant::now());
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(QueueError::connection("broker hiccup"));
            }
            Ok(Vec::new())
        }
        async fn ack(&self, _job: &ActiveJob) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(&self, _job: &ActiveJob, _error: &QueueError) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_fetch_backs_off_independently_of_poll_interval() {
        let provider = Arc::new(FlakyFetchProvider {
            failed_once: AtomicBool::new(false),
            fetch_times: Mutex::new(Vec::new()),
        });
        let handler = TestHandler::new(Duration::ZERO, 0);
        let mut worker = Worker::new(provider.clone(), handler, config()).unwrap();
        let mut rx = worker.subscribe();

        worker.start().await.unwrap();
        wait_until(
            || provider.fetch_times.lock().unwrap().len() >= 2,
            Duration::from_secs(2),
        )
        .await;
        worker.close(CloseOptions::default()).await.unwrap();

        let times = provider.fetch_times.lock().unwrap();
        let gap = times[1] - times[0];
        assert!(
            gap >= Duration::from_millis(90),
            "error_backoff (100ms) must gate the retry, not poll_interval (10ms); gap was {gap:?}"
        );

        let names: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.name()).collect::<Vec<_>>();
        assert!(names.contains(&"queue.error"));
    }

    /// Long-polling provider that never blocks: every fetch returns empty
    /// immediately, as the memory provider does while paused or during an
    /// overlapping fetch.
    struct InstantEmptyProvider {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl Provider for InstantEmptyProvider {
        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                supports_long_polling: true,
                ..ProviderCapabilities::default()
            }
        }
        async fn connect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        fn as_pull(self: Arc<Self>) -> Option<Arc<dyn PullProvider>> {
            Some(self)
        }
    }

    #[async_trait]
    impl PullProvider for InstantEmptyProvider {
        async fn fetch(
            &self,
            _count: usize,
            _wait: Option<Duration>,
        ) -> Result<Vec<ActiveJob>, QueueError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn ack(&self, _job: &ActiveJob) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(&self, _job: &ActiveJob, _error: &QueueError) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_long_poll_returning_instantly_is_paced_by_poll_interval() {
        let provider = Arc::new(InstantEmptyProvider {
            fetches: AtomicU32::new(0),
        });
        let handler = TestHandler::new(Duration::ZERO, 0);
        let mut worker = Worker::new(provider.clone(), handler, config()).unwrap();

        worker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.close(CloseOptions::default()).await.unwrap();

        let fetches = provider.fetches.load(Ordering::SeqCst);
        assert!(
            fetches <= 40,
            "a long poll returning instantly must still pace on poll_interval \
             (10ms), saw {fetches} fetches in 200ms"
        );
    }

    #[tokio::test]
    async fn fast_close_resolves_promptly_and_never_cancels_the_handler() {
        let (backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::from_millis(500), 0);
        let mut worker = Worker::new(provider, handler.clone(), config()).unwrap();

        backend.add(Job::new("slow", "q", serde_json::json!({}))).unwrap();
        worker.start().await.unwrap();
        wait_until(|| worker.active_jobs() == 1, Duration::from_secs(1)).await;

        let started = Instant::now();
        worker
            .close(CloseOptions {
                timeout: Duration::from_millis(100),
                finish_active_jobs: false,
                ..CloseOptions::default()
            })
            .await
            .unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "close must not wait out the 500ms handler"
        );
        assert_eq!(worker.state(), WorkerState::Stopped);

        // the detached job runs to completion and acks on its own
        wait_until(
            || backend.stats("q").map(|s| s.completed == 1).unwrap_or(false),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.active_jobs(), 0);
    }

    #[tokio::test]
    async fn graceful_close_finishes_active_jobs() {
        let (backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::from_millis(100), 0);
        let mut worker = Worker::new(provider, handler.clone(), config()).unwrap();

        backend.add(Job::new("slow", "q", serde_json::json!({}))).unwrap();
        worker.start().await.unwrap();
        wait_until(|| worker.active_jobs() == 1, Duration::from_secs(1)).await;

        worker.close(CloseOptions::default()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stats("q").unwrap().completed, 1);
        assert_eq!(worker.active_jobs(), 0);
    }

    /// Push provider delivering one job inline and reporting one
    /// operational error through the worker's callback.
    struct OneShotPushProvider {
        shutdown_called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Provider for OneShotPushProvider {
        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }
        async fn connect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), QueueError> {
            Ok(())
        }
        fn as_push(self: Arc<Self>) -> Option<Arc<dyn PushProvider>> {
            Some(self)
        }
    }

    #[async_trait]
    impl PushProvider for OneShotPushProvider {
        async fn process(
            &self,
            handler: Arc<dyn JobHandler>,
            opts: ProcessOptions,
        ) -> Result<ShutdownHandle, QueueError> {
            let job = Job::new("pushed", "q", serde_json::json!({"n": 1}));
            handler.handle(&job.data, &job).await?;
            (opts.on_error)(QueueError::connection("provider hiccup"));

            let flag = Arc::clone(&self.shutdown_called);
            Ok(ShutdownHandle::new(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
        }
    }

    #[tokio::test]
    async fn push_mode_delegates_and_instruments() {
        let shutdown_called = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(OneShotPushProvider {
            shutdown_called: Arc::clone(&shutdown_called),
        });
        let handler = TestHandler::new(Duration::ZERO, 0);
        let mut worker = Worker::new(provider, handler.clone(), config()).unwrap();
        let mut rx = worker.subscribe();

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // start is only valid from Idle
        let err = worker.start().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Configuration);

        worker.close(CloseOptions::default()).await.unwrap();
        assert!(shutdown_called.load(Ordering::SeqCst));

        let names: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.name()).collect::<Vec<_>>();
        assert!(names.contains(&"active"));
        assert!(names.contains(&"completed"));
        assert!(names.contains(&"queue.error"), "on_error must be re-emitted");
    }

    #[tokio::test]
    async fn close_before_start_is_a_noop() {
        let (_backend, provider) = pull_setup("q");
        let handler = TestHandler::new(Duration::ZERO, 0);
        let mut worker = Worker::new(provider, handler, config()).unwrap();
        worker.close(CloseOptions::default()).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
    }
}
