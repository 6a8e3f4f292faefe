use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;

use conveyor_core::{
    CloseOptions, Job, JobHandler, MemoryBackend, ProviderFactory, QueueError, QueueEvent, Worker,
    WorkerConfig,
};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Fails the first `n` invocations to show the retry path, then greets.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl JobHandler for HelloHandler {
    async fn handle(
        &self,
        data: &serde_json::Value,
        _job: &Job,
    ) -> Result<serde_json::Value, QueueError> {
        let payload: HelloPayload = serde_json::from_value(data.clone())
            .map_err(|e| QueueError::processing(format!("json decode: {e}")).non_retryable())?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(QueueError::processing(format!(
                "intentional failure (left={left})"
            )));
        }

        println!("Hello, {}!", payload.name);
        Ok(serde_json::json!({ "greeted": payload.name }))
    }
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // (A) shared backend, bound to one queue
    let backend = MemoryBackend::new();
    let provider = backend.provider_for("greetings");

    // (B) worker over the queue-scoped provider
    let config = WorkerConfig::new(Duration::from_millis(50), Duration::from_millis(500))
        .with_concurrency(2)
        .with_batch_size(2);
    let mut worker = Worker::new(provider, Arc::new(HelloHandler::new(2)), config)?;

    // (C) event surface -> log lines (external listener responsibility)
    let mut events = worker.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                QueueEvent::Failed { job, error, .. } => {
                    tracing::warn!(job_id = %job.id, error = %error, "job failed");
                }
                QueueEvent::QueueError { error } => {
                    tracing::error!(error = %error, "queue error");
                }
                other => tracing::info!(event = other.name(), "queue event"),
            }
        }
    });

    worker.start().await?;

    // (D) enqueue work, including a delayed job
    backend.add(Job::new(
        "hello",
        "greetings",
        serde_json::json!({ "name": "conveyor" }),
    ))?;
    backend.add(
        Job::new("hello", "greetings", serde_json::json!({ "name": "later" }))
            .scheduled_at(chrono_now_plus_millis(300)),
    )?;

    // (E) wait until everything is processed
    loop {
        let stats = backend.stats("greetings")?;
        if stats.completed + stats.failed >= 2 {
            tracing::info!(?stats, "all jobs settled");
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    worker
        .close(CloseOptions {
            disconnect_provider: true,
            ..CloseOptions::default()
        })
        .await?;
    listener.abort();
    Ok(())
}

fn chrono_now_plus_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() + chrono::Duration::milliseconds(ms)
}
