//! Error kinds shared across the core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level classification of a failure surfaced to a client or logged by
/// the scheduler. Distinct from the leaf `thiserror` enums owned by each
/// storage crate (`DbError`, `StoreError`, ...) — this is the vocabulary
/// the scheduler/fast-path/HTTP-contract layer reasons about.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnalyzeErrorKind {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    #[error("idempotency key conflict")]
    IdempotencyConflict,

    #[error("usage limit exceeded")]
    UsageLimit,

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("quality gate rejected: {0}")]
    QualityGateRejected(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,
}

impl AnalyzeErrorKind {
    /// Whether the scheduler's retry loop should requeue a card that failed
    /// with this error kind.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AnalyzeErrorKind::UpstreamTransient(_) | AnalyzeErrorKind::QualityGateRejected(_)
        )
    }

    /// Stable machine-readable code for `CardError.code` / HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AnalyzeErrorKind::InvalidInput(_) => "invalid_input",
            AnalyzeErrorKind::NotFound => "not_found",
            AnalyzeErrorKind::IdempotencyConflict => "idempotency_key_conflict",
            AnalyzeErrorKind::UsageLimit => "usage_limit",
            AnalyzeErrorKind::UpstreamTransient(_) => "upstream_transient",
            AnalyzeErrorKind::QualityGateRejected(_) => "quality_gate_rejected",
            AnalyzeErrorKind::Internal(_) => "internal",
            AnalyzeErrorKind::Cancelled => "cancelled",
            AnalyzeErrorKind::Timeout => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_gate_rejection_are_retryable() {
        assert!(AnalyzeErrorKind::UpstreamTransient("timeout".into()).retryable());
        assert!(AnalyzeErrorKind::QualityGateRejected("empty".into()).retryable());
    }

    #[test]
    fn validation_and_internal_are_not_retryable() {
        assert!(!AnalyzeErrorKind::InvalidInput("bad url".into()).retryable());
        assert!(!AnalyzeErrorKind::Internal("panic".into()).retryable());
        assert!(!AnalyzeErrorKind::Cancelled.retryable());
        assert!(!AnalyzeErrorKind::Timeout.retryable());
    }
}
