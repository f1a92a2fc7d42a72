//! Job queue error model.

use thiserror::Error;

/// Result type used across the job queue.
pub type JobResult<T> = Result<T, JobError>;

/// Job-queue-level error.
///
/// Component errors (store, queue, provider) convert into this taxonomy at the
/// service boundary; callers decide retry and status mapping from the variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Entity absent, or in an unexpected state for the requested transition.
    #[error("not found: {0}")]
    NotFound(String),

    /// A creation collided without a usable idempotency key.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed or missing input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Queue or store unreachable. Retried by the caller after a backoff.
    #[error("infrastructure unavailable: {0}")]
    Transient(String),

    /// Execution failed or timed out; recorded on the job, not retried here.
    #[error("provider error: {0}")]
    Provider(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
