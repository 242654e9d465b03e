//! Hashing helpers for cache partitioning and idempotency replay.
//!
//! `options_hash`/`request_hash` sort keys, ignore non-semantic ones,
//! serialize canonically, and hash with SHA-256. `build_artifact_key`
//! follows the `hash_parts` pattern of blake3-hashing a `0x1f`-separated
//! concatenation of stable components into one fixed-length hex string.

use blake3::Hasher as Blake3Hasher;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const SEP: u8 = 0x1f;

/// Keys that affect transport/UI/preflight behavior but never the analysis
/// output itself, so they must not perturb the options hash or cache key.
const IGNORED_OPTION_KEYS: &[&str] = &[
    "freeform",
    "_requested_cards",
    "client_trace",
    "force_refresh",
    "allow_ambiguous",
];

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Blake3Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Recursively sort a JSON value's object keys so serialization is
/// byte-stable regardless of field insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Strip non-semantic option keys, returning the canonical (sorted) subset
/// that is allowed to affect analysis output and therefore cache identity.
pub fn normalize_run_options(options: &Value) -> Value {
    let cleaned = match options {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = k.trim();
                if key.is_empty() || IGNORED_OPTION_KEYS.contains(&key) {
                    continue;
                }
                out.insert(key.to_string(), v.clone());
            }
            Value::Object(out)
        }
        _ => Value::Object(serde_json::Map::new()),
    };
    canonicalize(&cleaned)
}

/// SHA-256 hex digest over the canonical, semantically-relevant subset of
/// request options.
pub fn compute_options_hash(options: &Value) -> String {
    let cleaned = normalize_run_options(options);
    let raw = serde_json::to_string(&cleaned).unwrap_or_else(|_| "{}".to_string());
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest over the full normalized request payload, used for
/// idempotency-key conflict detection.
pub fn compute_request_hash(source: &str, normalized_input: &Value, requested_cards: &[String], options: &Value) -> String {
    let mut cards_sorted = requested_cards.to_vec();
    cards_sorted.sort();
    let payload = serde_json::json!({
        "source": source,
        "input": canonicalize(normalized_input),
        "cards": cards_sorted,
        "options": normalize_run_options(options),
    });
    let raw = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable key format for `CacheArtifact` rows and the Local KV Cache: a
/// canonical concatenation of (source, subject_key, pipeline_version,
/// options_hash, kind) hashed to a fixed-length hex string.
pub fn build_artifact_key(
    source: &str,
    subject_key: &str,
    pipeline_version: &str,
    options_hash: &str,
    kind: &str,
) -> String {
    hash_parts(&[source, subject_key, pipeline_version, options_hash, kind])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_hash_ignores_non_semantic_keys_and_key_order() {
        let a = json!({"lang": "en", "force_refresh": true, "depth": 2});
        let b = json!({"depth": 2, "lang": "en", "force_refresh": false});
        assert_eq!(compute_options_hash(&a), compute_options_hash(&b));
    }

    #[test]
    fn options_hash_changes_with_semantic_option() {
        let a = json!({"depth": 2});
        let b = json!({"depth": 3});
        assert_ne!(compute_options_hash(&a), compute_options_hash(&b));
    }

    #[test]
    fn artifact_key_is_stable_and_distinguishes_kind() {
        let k1 = build_artifact_key("github", "login:torvalds", "v1", "abc", "final_result");
        let k2 = build_artifact_key("github", "login:torvalds", "v1", "abc", "final_result");
        let k3 = build_artifact_key("github", "login:torvalds", "v1", "abc", "resource.github.data");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn request_hash_distinguishes_requested_cards_order_independent() {
        let opts = json!({});
        let input = json!({"content": "torvalds"});
        let h1 = compute_request_hash("github", &input, &["profile".into(), "repos".into()], &opts);
        let h2 = compute_request_hash("github", &input, &["repos".into(), "profile".into()], &opts);
        assert_eq!(h1, h2);
        let h3 = compute_request_hash("github", &input, &["profile".into()], &opts);
        assert_ne!(h1, h3);
    }
}
