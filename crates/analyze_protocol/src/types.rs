//! Canonical domain types shared by every crate in the workspace.
//!
//! These mirror the entities of the job-orchestration data model: jobs,
//! cards, events, artifacts and the two cache tiers. Storage crates persist
//! these shapes; the scheduler and cache crates operate on them directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(JobId)
    }
}

/// Unique identifier for a card within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(i64);

impl CardId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CardId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Monotonic per-job event sequence number. Starts at 1.
pub type Seq = i64;

/// Unique identifier for a cache subject row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(i64);

impl SubjectId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SubjectId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a job. Terminal values are `Completed`, `Partial`,
/// `Failed`, `Cancelled` — once reached the row never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Partial | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "partial" => JobStatus::Partial,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl CardStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CardStatus::Completed | CardStatus::Failed | CardStatus::Timeout | CardStatus::Skipped
        )
    }

    /// Cards in one of these states satisfy a dependent's `depends_on` gate.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, CardStatus::Completed | CardStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Pending => "pending",
            CardStatus::Ready => "ready",
            CardStatus::Running => "running",
            CardStatus::Completed => "completed",
            CardStatus::Failed => "failed",
            CardStatus::Timeout => "timeout",
            CardStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => CardStatus::Pending,
            "ready" => CardStatus::Ready,
            "running" => CardStatus::Running,
            "completed" => CardStatus::Completed,
            "failed" => CardStatus::Failed,
            "timeout" => CardStatus::Timeout,
            "skipped" => CardStatus::Skipped,
            _ => return None,
        })
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `true` when a card type is internal (never surfaced to a client):
/// `full_report`, or anything prefixed `resource.`.
pub fn is_internal_card_type(card_type: &str) -> bool {
    card_type == "full_report" || card_type.starts_with("resource.")
}

/// A single card's client-visible envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: serde_json::Map<String, serde_json::Value>,
}

/// Specification of one card in a plan (planner output, scheduler input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSpec {
    pub card_type: String,
    pub depends_on: Vec<String>,
    pub priority: i32,
    pub concurrency_group: String,
}

/// A full card row as stored by the Job Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub job_id: JobId,
    pub card_type: String,
    pub status: CardStatus,
    pub depends_on: BTreeSet<String>,
    pub priority: i32,
    pub concurrency_group: String,
    pub retry_count: i32,
    pub output: CardOutput,
    pub internal: bool,
}

/// A full job row as stored by the Job Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: String,
    pub source: String,
    pub subject_key: Option<String>,
    pub input: serde_json::Value,
    pub options: serde_json::Value,
    pub status: JobStatus,
    pub last_seq: Seq,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub idempotency_key: Option<String>,
    pub request_hash: Option<String>,
}

/// A job together with its cards, keyed by `card_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithCards {
    pub job: Job,
    pub cards: Vec<Card>,
}

/// Kinds of events that appear on a job's event log / SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    CardStarted {
        card: String,
    },
    CardProgress {
        card: String,
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    CardDelta {
        card: String,
        delta: serde_json::Value,
    },
    CardAppend {
        card: String,
        path: String,
        items: Vec<serde_json::Value>,
        dedup_key: Option<String>,
        partial: bool,
    },
    CardCompleted {
        card: String,
        payload: CardOutput,
        internal: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache: Option<CacheInfo>,
    },
    CardFailed {
        card: String,
        error: CardError,
    },
    JobCompleted {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache: Option<CacheInfo>,
    },
    JobFailed {
        status: JobStatus,
    },
}

impl EventType {
    pub fn kind(&self) -> &'static str {
        match self {
            EventType::CardStarted { .. } => "card.started",
            EventType::CardProgress { .. } => "card.progress",
            EventType::CardDelta { .. } => "card.delta",
            EventType::CardAppend { .. } => "card.append",
            EventType::CardCompleted { .. } => "card.completed",
            EventType::CardFailed { .. } => "card.failed",
            EventType::JobCompleted { .. } => "job.completed",
            EventType::JobFailed { .. } => "job.failed",
        }
    }

    pub fn is_job_terminal(&self) -> bool {
        matches!(self, EventType::JobCompleted { .. } | EventType::JobFailed { .. })
    }
}

/// Cache provenance attached to events/responses produced from a cache hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheInfo {
    pub hit: bool,
    pub stale: bool,
    pub as_of: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Error payload attached to `card.failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// A row in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub job_id: JobId,
    pub seq: Seq,
    pub card_id: Option<CardId>,
    pub event_type: EventType,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A stable cache-subject identity (source, subject_key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSubject {
    pub id: SubjectId,
    pub source: String,
    pub subject_key: String,
    pub canonical_input: serde_json::Value,
}

/// A cached artifact row (terminal bundle or reusable intermediate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheArtifact {
    pub subject_id: SubjectId,
    pub pipeline_version: String,
    pub options_hash: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub fingerprint: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub meta: serde_json::Value,
}

/// Final terminal bundle: `{ cards: { <card_type>: <payload> } }`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FinalResult {
    pub cards: std::collections::BTreeMap<String, serde_json::Value>,
}

/// State of a refresh-run mutex row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRunState {
    Running,
    Failed,
    Done,
}

impl RefreshRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshRunState::Running => "running",
            RefreshRunState::Failed => "failed",
            RefreshRunState::Done => "done",
        }
    }
}
