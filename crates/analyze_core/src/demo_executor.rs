//! A stand-in `CardExecutor`/`QualityGate` pair used by the CLI when no
//! real fetcher/enricher implementation is injected. Real per-source
//! executors live outside this crate; this one only echoes its input so
//! `analyze submit` produces something to look at end-to-end.

use analyze_scheduler::{CardContext, CardExecutor, ExecutorError, GateVerdict, ProgressSink, QualityGate, QualityGateContext};
use async_trait::async_trait;

pub struct EchoExecutor;

#[async_trait]
impl CardExecutor for EchoExecutor {
    async fn execute_card(&self, card: &CardContext, progress: ProgressSink) -> Result<serde_json::Value, ExecutorError> {
        card.check_cancelled()?;
        progress.emit("fetch", Some(format!("running {}", card.card_type)), None);
        if card.card_type.starts_with("resource.") {
            let payload = serde_json::json!({
                "card_type": card.card_type,
                "source": card.source,
                "input": card.input,
            });
            card.write_artifact(&card.card_type, &payload).await?;
            return Ok(payload);
        }
        Ok(serde_json::json!({
            "card_type": card.card_type,
            "echo": card.input,
        }))
    }
}

pub struct PassthroughGate;

impl QualityGate for PassthroughGate {
    fn check(&self, _source: &str, _card_type: &str, data: &serde_json::Value, _ctx: &QualityGateContext) -> GateVerdict {
        GateVerdict::accept(data.clone())
    }
}
