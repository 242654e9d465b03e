//! Card Executor Interface: the adapter boundary to data fetchers and
//! LLM enrichers. The scheduler knows cards only through this contract,
//! injected at construction — implementations are external to the core.

use analyze_protocol::{CardId, JobId};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;

/// Everything an executor needs to run one card. The executor is pure
/// with respect to the core's state except for: reading artifacts via the
/// Artifact Store, writing the artifact it produces, and emitting
/// progress events through `ProgressSink`.
#[derive(Clone)]
pub struct CardContext {
    pub job_id: JobId,
    pub card_id: CardId,
    pub card_type: String,
    pub source: String,
    pub input: serde_json::Value,
    pub options: serde_json::Value,
    pub pool: SqlitePool,
    /// Fires when this card's job is cancelled or the scheduler is
    /// shutting down. A first-class value carried per card, not a
    /// process-global flag — executors cooperate by checking it (or
    /// calling `check_cancelled`) at safe points in long-running work.
    pub cancellation: CancellationToken,
}

impl CardContext {
    /// Read a dependency's payload from the Artifact Store — downstream
    /// cards never read `Card.output` of their dependencies directly.
    pub async fn read_artifact(&self, key: &str) -> Result<Option<serde_json::Value>, ExecutorError> {
        analyze_store::artifacts::get_artifact(&self.pool, self.job_id, key)
            .await
            .map_err(|e| ExecutorError::Permanent(e.to_string()))
    }

    /// `resource.*` producers call this to write their full payload,
    /// keyed by their own `card_type`.
    pub async fn write_artifact(&self, key: &str, payload: &serde_json::Value) -> Result<(), ExecutorError> {
        analyze_store::artifacts::put_artifact(&self.pool, self.job_id, key, payload)
            .await
            .map_err(|e| ExecutorError::Permanent(e.to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Safe-point check an executor calls between steps of long-running
    /// work; bails with `ExecutorError::Cancelled` once the signal fires.
    pub fn check_cancelled(&self) -> Result<(), ExecutorError> {
        if self.cancellation.is_cancelled() {
            Err(ExecutorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One step of progress reported mid-execution, forwarded to subscribers
/// as a `card.progress` event and never persisted as card output.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub step: String,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// What an executor can push onto its `ProgressSink`. `Progress` maps to a
/// `card.progress` event; `Delta`/`Append` map to the dedicated event
/// kinds a card uses to stream partial data to the UI.
#[derive(Debug, Clone)]
pub enum ProgressMessage {
    Progress(ProgressEvent),
    Delta {
        delta: serde_json::Value,
    },
    Append {
        path: String,
        items: Vec<serde_json::Value>,
        dedup_key: Option<String>,
        partial: bool,
    },
}

/// Cheap, cloneable handle an executor uses to report progress without
/// direct access to the Event Store.
#[derive(Clone)]
pub struct ProgressSink {
    sender: tokio::sync::mpsc::UnboundedSender<ProgressMessage>,
}

impl ProgressSink {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<ProgressMessage>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, step: impl Into<String>, message: Option<String>, data: Option<serde_json::Value>) {
        let _ = self.sender.send(ProgressMessage::Progress(ProgressEvent {
            step: step.into(),
            message,
            data,
        }));
    }

    pub fn emit_delta(&self, delta: serde_json::Value) {
        let _ = self.sender.send(ProgressMessage::Delta { delta });
    }

    pub fn emit_append(&self, path: impl Into<String>, items: Vec<serde_json::Value>, dedup_key: Option<String>, partial: bool) {
        let _ = self.sender.send(ProgressMessage::Append {
            path: path.into(),
            items,
            dedup_key,
            partial,
        });
    }
}

#[async_trait::async_trait]
pub trait CardExecutor: Send + Sync {
    async fn execute_card(
        &self,
        card: &CardContext,
        progress: ProgressSink,
    ) -> Result<serde_json::Value, ExecutorError>;
}
