//! Provider contract: the seam between the worker and queue backends.
//!
//! A provider exposes exactly one delivery model:
//! - **push**: the provider invokes the handler itself and owns
//!   fetch/retry/ack internally ([`PushProvider`]);
//! - **pull**: the consumer fetches jobs and must separately ack or nack
//!   them ([`PullProvider`]).
//!
//! If an implementation exposes both, push takes precedence: the party best
//! positioned to manage blocking I/O should own the fetch loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::QueueError;
use crate::job::{ActiveJob, Job};

/// Static capability descriptor, queried once at worker start.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCapabilities {
    /// `fetch` can block server-side for a wait hint instead of the worker
    /// busy-polling.
    pub supports_long_polling: bool,

    /// Jobs with a future `scheduled_for` are held back until due.
    pub supports_delayed_jobs: bool,

    /// Fetch ordering honors job priority.
    pub supports_priority: bool,

    /// Upper bound the provider puts on one fetch, if any.
    pub max_batch_size: Option<usize>,
}

/// The user's job handler.
///
/// Asynchronous and non-throwing by convention: failures are reported
/// through the `Result`, and the retryable flag on the error drives the
/// provider's retry decision.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        data: &serde_json::Value,
        job: &Job,
    ) -> Result<serde_json::Value, QueueError>;
}

/// Base provider contract shared by both delivery models.
///
/// `connect`/`disconnect` are idempotent. The model downcasts return `None`
/// by default; an implementation overrides exactly one of them (push wins if
/// both are overridden).
#[async_trait]
pub trait Provider: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    async fn connect(&self) -> Result<(), QueueError>;

    async fn disconnect(&self) -> Result<(), QueueError>;

    fn as_push(self: Arc<Self>) -> Option<Arc<dyn PushProvider>> {
        None
    }

    fn as_pull(self: Arc<Self>) -> Option<Arc<dyn PullProvider>> {
        None
    }
}

/// Options handed to [`PushProvider::process`].
#[derive(Clone)]
pub struct ProcessOptions {
    /// Concurrency bound the provider must enforce; it owns the fetch loop.
    pub concurrency: usize,

    /// Operational errors inside the provider's loop. The worker re-emits
    /// these as `queue.error` events.
    pub on_error: Arc<dyn Fn(QueueError) + Send + Sync>,
}

/// Deferred shutdown for a push provider's internal loop, invoked when the
/// worker closes.
pub struct ShutdownHandle(Box<dyn FnOnce() -> BoxFuture<'static, Result<(), QueueError>> + Send>);

impl ShutdownHandle {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    pub async fn shutdown(self) -> Result<(), QueueError> {
        (self.0)().await
    }
}

/// Push delivery: the provider owns fetch, concurrency, and retry, and calls
/// the handler directly. The worker only instruments.
///
/// Contract: push providers must honor the same `retryable` error-flag
/// semantics as pull-model nack — an error explicitly marked non-retryable
/// short-circuits retry even with attempts remaining.
#[async_trait]
pub trait PushProvider: Provider {
    /// Start delivering jobs to `handler`. Returns the shutdown handle the
    /// worker invokes on close.
    async fn process(
        &self,
        handler: Arc<dyn JobHandler>,
        opts: ProcessOptions,
    ) -> Result<ShutdownHandle, QueueError>;
}

/// Pull delivery: the consumer owns fetch cadence and concurrency.
#[async_trait]
pub trait PullProvider: Provider {
    /// Claim up to `count` ready jobs, flipping them to Active. `wait` is a
    /// long-polling hint; providers that declared support may block up to
    /// that long server-side when nothing is ready.
    async fn fetch(
        &self,
        count: usize,
        wait: Option<Duration>,
    ) -> Result<Vec<ActiveJob>, QueueError>;

    /// Acknowledge successful processing.
    async fn ack(&self, job: &ActiveJob) -> Result<(), QueueError>;

    /// Report failed processing. The provider decides retry vs terminal
    /// failure from `error.retryable` and the job's remaining attempts.
    async fn nack(&self, job: &ActiveJob, error: &QueueError) -> Result<(), QueueError>;
}

/// Binds a shared multi-queue provider instance to one queue name, yielding
/// a queue-scoped provider.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, queue_name: &str) -> Arc<dyn Provider>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareProvider;

    #[async_trait]
    impl Provider for BareProvider {
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

    #[test]
    fn downcasts_default_to_none() {
        let provider: Arc<dyn Provider> = Arc::new(BareProvider);
        assert!(provider.clone().as_push().is_none());
        assert!(provider.as_pull().is_none());
    }

    #[tokio::test]
    async fn shutdown_handle_runs_its_future() {
        let handle = ShutdownHandle::new(|| async { Ok(()) });
        handle.shutdown().await.unwrap();
    }
}
