//! Leaf error types for the scheduler and its pluggable interfaces.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] analyze_store::StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] analyze_cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job {0} not found")]
    JobNotFound(analyze_protocol::JobId),
}

/// Error surfaced by a `CardExecutor`. Distinguishes retryable transient
/// failures (timeouts, rate limits, temporary-unavailable markers) from
/// permanent ones (validation, unknown card type, missing credentials).
#[derive(Debug, Error, Clone)]
pub enum ExecutorError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    /// Raised by `CardContext::check_cancelled` when the job's
    /// cancellation signal fires while a card is in flight.
    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ExecutorError::Transient(m) | ExecutorError::Permanent(m) => m,
            ExecutorError::Cancelled => "card cancelled",
        }
    }
}
