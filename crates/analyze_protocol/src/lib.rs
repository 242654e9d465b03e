//! Shared domain types, ids, hashing and configuration for the profile
//! analysis core. Every other crate in the workspace depends on this one
//! for the entities that cross component boundaries: `Job`, `Card`,
//! `Event`, `CacheArtifact`, and the associated ids.

pub mod config;
pub mod defaults;
pub mod error;
pub mod idempotency;
pub mod types;

pub use config::{BackgroundRefreshConfig, CachePolicy, RetryPolicy, SchedulerConfig, SystemConfig};
pub use error::AnalyzeErrorKind;
pub use idempotency::{build_artifact_key, compute_options_hash, compute_request_hash, normalize_run_options};
pub use types::{
    Card, CardError, CardId, CardOutput, CardSpec, CardStatus, CacheArtifact, CacheInfo,
    CacheSubject, Event, EventType, FinalResult, Job, JobId, JobStatus, JobWithCards,
    RefreshRunState, Seq, SubjectId, is_internal_card_type,
};
