//! conveyor-core
//!
//! Provider-agnostic job-queue consumer. A [`Worker`] processes jobs whether
//! the underlying queue delivers work by push (the provider calls the
//! handler) or pull (the consumer fetches, then acks/nacks), behind one
//! uniform, event-emitting API with bounded concurrency and backpressure.
//!
//! Modules:
//! - **job**: Job/ActiveJob value types and per-job options
//! - **error**: structured `QueueError` with a retryable flag
//! - **events**: closed lifecycle event enum over a broadcast bus
//! - **provider**: the push/pull provider contract (the seam real brokers
//!   implement)
//! - **memory**: reference in-memory pull provider
//! - **worker**: delivery-model detection, instrumentation, concurrency,
//!   graceful shutdown

pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod provider;
pub mod worker;

pub use error::{ErrorCode, QueueError};
pub use events::{EventBus, QueueEvent};
pub use job::{ActiveJob, Job, JobOptions, JobStatus};
pub use memory::{HealthStatus, MemoryBackend, MemoryProvider, QueueStats};
pub use provider::{
    JobHandler, ProcessOptions, Provider, ProviderCapabilities, ProviderFactory, PullProvider,
    PushProvider, ShutdownHandle,
};
pub use worker::{CloseOptions, Worker, WorkerConfig, WorkerState};
