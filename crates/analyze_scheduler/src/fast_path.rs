//! Cache-Hit Fast Path: materialize a completed job bundle from a
//! cached `final_result` without ever touching the DAG scheduler.

use analyze_cache::{is_cacheable_subject, LocalKvCache};
use analyze_protocol::{CacheInfo, CachePolicy, FinalResult, JobWithCards};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::quality_gate::{QualityGate, QualityGateContext};
use crate::refresher::BackgroundRefresher;

/// Everything needed to attempt a fast-path hit for one incoming request.
pub struct FastPathRequest<'a> {
    pub user_id: &'a str,
    pub source: &'a str,
    pub subject_key: &'a str,
    pub canonical_input: &'a serde_json::Value,
    pub options: &'a serde_json::Value,
    pub requested_cards: &'a [String],
    pub pipeline_version: &'a str,
    pub options_hash: &'a str,
    pub idempotency_key: Option<&'a str>,
    pub request_hash: Option<&'a str>,
}

pub struct FastPathOutcome {
    pub job: JobWithCards,
    pub cache_stale: bool,
    pub cache_source: &'static str,
}

fn local_cache_key(req: &FastPathRequest<'_>) -> String {
    analyze_protocol::build_artifact_key(req.source, req.subject_key, req.pipeline_version, req.options_hash, "final_result")
}

/// Every business card the caller asked for (or would receive by default)
/// must be present in the cached payload and pass its Quality Gate.
fn passes_usability_predicate(
    quality_gate: &dyn QualityGate,
    source: &str,
    job_id_hint: analyze_protocol::JobId,
    requested_cards: &[String],
    final_result: &FinalResult,
) -> bool {
    let ctx = QualityGateContext { job_id: job_id_hint, full_report: None };
    requested_cards.iter().all(|card_type| {
        if analyze_protocol::is_internal_card_type(card_type) {
            return true;
        }
        match final_result.cards.get(card_type) {
            Some(data) => quality_gate.check(source, card_type, data, &ctx).is_accept(),
            None => false,
        }
    })
}

/// Attempt the fast path. Returns `Ok(None)` whenever the request should
/// fall through to normal scheduling — non-cacheable subject, cache miss,
/// or a cached payload that fails the usability predicate.
pub async fn try_fast_path(
    pool: &SqlitePool,
    quality_gate: &dyn QualityGate,
    local_cache: Option<&LocalKvCache>,
    refresher: Option<&BackgroundRefresher>,
    req: &FastPathRequest<'_>,
) -> Result<Option<FastPathOutcome>> {
    if !is_cacheable_subject(req.source, req.subject_key) {
        return Ok(None);
    }

    let policy = CachePolicy::for_source(req.source);
    let local_key = local_cache_key(req);

    let (final_result, stale, cache_source, hit_count): (FinalResult, bool, &'static str, i64) =
        if let Some(local) = local_cache {
            if let Some(cached) = local.get_json(&local_key).await? {
                let hits = local.record_hit(&local_key).await?;
                let envelope: LocalEnvelope = serde_json::from_value(cached)?;
                (envelope.payload, envelope.stale, "local_kv_cache", hits)
            } else {
                match load_from_durable(pool, req, policy.max_stale_secs).await? {
                    Some((payload, stale)) => {
                        local
                            .set_json(
                                &local_key,
                                &serde_json::to_value(LocalEnvelope { payload: payload.clone(), stale })?,
                                Some(Utc::now().timestamp() + policy.ttl_secs.min(300).max(1)),
                            )
                            .await?;
                        (payload, stale, "analysis_cache", 0)
                    }
                    None => return Ok(None),
                }
            }
        } else {
            match load_from_durable(pool, req, policy.max_stale_secs).await? {
                Some((payload, stale)) => (payload, stale, "analysis_cache", 0),
                None => return Ok(None),
            }
        };

    if !passes_usability_predicate(
        quality_gate,
        req.source,
        analyze_protocol::JobId::new(0),
        req.requested_cards,
        &final_result,
    ) {
        debug!(source = req.source, subject_key = req.subject_key, "fast path: cached payload failed usability predicate");
        return Ok(None);
    }

    let as_of = Utc::now();
    let cards: Vec<analyze_store::jobs::CompletedCard> = req
        .requested_cards
        .iter()
        .filter(|card_type| !analyze_protocol::is_internal_card_type(card_type))
        .map(|card_type| analyze_store::jobs::CompletedCard {
            card_type: card_type.clone(),
            output: analyze_protocol::CardOutput {
                data: final_result.cards.get(card_type).cloned(),
                stream: Default::default(),
            },
            cache: CacheInfo { hit: true, stale, as_of, source: Some(cache_source.to_string()) },
        })
        .collect();

    let outcome = analyze_store::jobs::create_completed_job_bundle(
        pool,
        req.user_id,
        req.source,
        Some(req.subject_key),
        req.canonical_input,
        req.options,
        &cards,
        req.idempotency_key,
        req.request_hash,
    )
    .await
    .map_err(SchedulerError::Store)?;

    if outcome.created && (stale || should_refresh_on_hit_count(hit_count, policy.refresh_n_hits)) {
        if let Some(refresher) = refresher {
            refresher.maybe_submit_refresh(
                req.source,
                req.subject_key,
                req.pipeline_version,
                req.options_hash,
                req.canonical_input.clone(),
                req.options.clone(),
                req.requested_cards.to_vec(),
            );
        }
    }

    Ok(Some(FastPathOutcome { job: outcome.job, cache_stale: stale, cache_source }))
}

async fn load_from_durable(
    pool: &SqlitePool,
    req: &FastPathRequest<'_>,
    max_stale_secs: i64,
) -> Result<Option<(FinalResult, bool)>> {
    let hit = analyze_cache::durable::get_cached_final_result(
        pool,
        req.source,
        req.subject_key,
        req.pipeline_version,
        req.options_hash,
        max_stale_secs,
    )
    .await
    .map_err(SchedulerError::Cache)?;
    match hit {
        Some(cached) => {
            let final_result: FinalResult = serde_json::from_value(cached.payload)?;
            Ok(Some((final_result, cached.stale)))
        }
        None => Ok(None),
    }
}

/// True once `hits` has crossed a multiple of the per-source
/// `refresh_n_hits` threshold. `hits` is the Local KV Cache's own
/// per-key counter (`LocalKvCache::record_hit`), zero when the hit came
/// straight from the durable Analysis Cache instead.
fn should_refresh_on_hit_count(hits: i64, refresh_n_hits: i64) -> bool {
    refresh_n_hits > 0 && hits > 0 && hits % refresh_n_hits == 0
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LocalEnvelope {
    payload: FinalResult,
    stale: bool,
}
