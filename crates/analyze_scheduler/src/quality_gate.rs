//! Quality Gate: a pure, synchronous predicate over a card's produced
//! data, reimplementable without any LLM call. Real per-source predicates
//! are external and injected — the core only owns the interface and
//! ships a no-op default.

use analyze_protocol::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub action: GateAction,
    pub normalized: serde_json::Value,
    pub issue: Option<String>,
}

impl GateVerdict {
    pub fn accept(normalized: serde_json::Value) -> Self {
        Self {
            action: GateAction::Accept,
            normalized,
            issue: None,
        }
    }

    pub fn reject(normalized: serde_json::Value, issue: impl Into<String>) -> Self {
        Self {
            action: GateAction::Reject,
            normalized,
            issue: Some(issue.into()),
        }
    }

    pub fn is_accept(&self) -> bool {
        self.action == GateAction::Accept
    }
}

pub struct QualityGateContext {
    pub job_id: JobId,
    pub full_report: Option<serde_json::Value>,
}

pub trait QualityGate: Send + Sync {
    fn check(&self, source: &str, card_type: &str, data: &serde_json::Value, ctx: &QualityGateContext) -> GateVerdict;
}

/// Prunes null/empty-string object values, otherwise always accepts.
/// Default/test implementation — real per-source policies are injected.
pub struct NoopGate;

fn prune_empty(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if v.is_null() {
                    continue;
                }
                if let serde_json::Value::String(s) = v {
                    if s.is_empty() {
                        continue;
                    }
                }
                out.insert(k.clone(), prune_empty(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(prune_empty).collect()),
        other => other.clone(),
    }
}

impl QualityGate for NoopGate {
    fn check(&self, _source: &str, _card_type: &str, data: &serde_json::Value, _ctx: &QualityGateContext) -> GateVerdict {
        GateVerdict::accept(prune_empty(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_gate_always_accepts_and_prunes_nulls() {
        let gate = NoopGate;
        let ctx = QualityGateContext {
            job_id: JobId::new(1),
            full_report: None,
        };
        let verdict = gate.check(
            "github",
            "profile",
            &serde_json::json!({"name": "torvalds", "bio": null, "company": ""}),
            &ctx,
        );
        assert!(verdict.is_accept());
        assert_eq!(verdict.normalized, serde_json::json!({"name": "torvalds"}));
    }
}
