//! Leaf error type for job/event/artifact storage operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] analyze_db::DbError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job {0} not found")]
    JobNotFound(analyze_protocol::JobId),

    #[error("card {0:?} not found on job {1}")]
    CardNotFound(String, analyze_protocol::JobId),

    #[error("idempotency key conflict for user {0}")]
    IdempotencyConflict(String),

    #[error("artifact {key:?} already written for job {job_id}")]
    ArtifactAlreadyWritten {
        job_id: analyze_protocol::JobId,
        key: String,
    },
}
