//! Structured queue errors with a retryable flag.

use std::sync::Arc;

use thiserror::Error;

/// Operational classification of a [`QueueError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Broker/provider connectivity failure.
    Connection,

    /// Job processing failure (handler or provider-side execution).
    Processing,

    /// Duplicate job id within a queue.
    Duplicate,

    /// Queue or job no longer exists.
    NotFound,

    /// Invalid construction-time options. Fatal and synchronous.
    Configuration,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Connection => "CONNECTION",
            ErrorCode::Processing => "PROCESSING",
            ErrorCode::Duplicate => "DUPLICATE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Configuration => "CONFIGURATION",
        }
    }
}

/// Error for every provider and worker operation.
///
/// Design:
/// - `retryable` drives the nack retry decision: an error explicitly marked
///   non-retryable short-circuits retry even with attempts remaining.
/// - The cause is held behind `Arc` so errors are `Clone` and can ride on
///   the broadcast event surface.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct QueueError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl QueueError {
    fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            cause: None,
        }
    }

    /// Connectivity failure; retryable by default.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Connection, message, true)
    }

    /// Processing failure; retryable by default.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Processing, message, true)
    }

    /// Duplicate job id; never retryable.
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Duplicate, message, false)
    }

    /// Missing queue or job; never retryable.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message, false)
    }

    /// Invalid options; never retryable.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Configuration, message, false)
    }

    /// Mark this error as non-retryable, overriding the code default.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach the underlying error.
    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}
