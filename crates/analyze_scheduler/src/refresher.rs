//! Background Refresher: a small fire-and-forget pool that
//! re-executes a pipeline behind a stale or heavily-hit cache entry
//! without blocking the request that triggered it. Ported from
//! `bg_refresh.py`'s `submit`/`_run_safe` pair — failures are logged, never
//! propagated, and the caller never awaits the refresh itself.

use std::sync::Arc;
use std::time::Instant;

use analyze_plan::CardMatrix;
use analyze_protocol::BackgroundRefreshConfig;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::scheduler::Scheduler;

pub struct BackgroundRefresher {
    pool: SqlitePool,
    scheduler: Arc<Scheduler>,
    matrix: Arc<CardMatrix>,
    config: BackgroundRefreshConfig,
    permits: Arc<Semaphore>,
    recent: DashMap<String, Instant>,
}

impl BackgroundRefresher {
    pub fn new(pool: SqlitePool, scheduler: Arc<Scheduler>, matrix: Arc<CardMatrix>, config: BackgroundRefreshConfig) -> Self {
        Self {
            pool,
            scheduler,
            matrix,
            permits: Arc::new(Semaphore::new(config.max_workers)),
            recent: DashMap::new(),
            config,
        }
    }

    /// Fire a refresh for `(source, subject_key, pipeline_version,
    /// options_hash)` unless the feature is disabled or a refresh for the
    /// same artifact key was already submitted within the dedup window.
    #[allow(clippy::too_many_arguments)]
    pub fn maybe_submit_refresh(
        &self,
        source: &str,
        subject_key: &str,
        pipeline_version: &str,
        options_hash: &str,
        canonical_input: serde_json::Value,
        options: serde_json::Value,
        requested_cards: Vec<String>,
    ) {
        if !self.config.enabled {
            return;
        }
        let key = analyze_protocol::build_artifact_key(source, subject_key, pipeline_version, options_hash, "final_result");
        let now = Instant::now();
        if let Some(last) = self.recent.get(&key) {
            if now.duration_since(*last) < self.config.dedup_window {
                debug!(artifact_key = %key, "background refresh suppressed by dedup window");
                return;
            }
        }
        self.recent.insert(key.clone(), now);

        let permits = Arc::clone(&self.permits);
        let pool = self.pool.clone();
        let scheduler = Arc::clone(&self.scheduler);
        let matrix = Arc::clone(&self.matrix);
        let source = source.to_string();
        let subject_key = subject_key.to_string();

        tokio::spawn(async move {
            let Ok(permit) = permits.try_acquire_owned() else {
                debug!(artifact_key = %key, "background refresh skipped: pool saturated");
                return;
            };
            if let Err(e) = run_refresh(&pool, &scheduler, &matrix, &key, &source, &subject_key, canonical_input, options, requested_cards).await {
                error!(source = %source, subject_key = %subject_key, error = %e, "background refresh failed");
            }
            drop(permit);
        });
    }
}

/// Claims the refresh-run lock for `artifact_key` before doing anything
/// else, so two processes racing the same stale cache entry don't both
/// spin up a recompute job.
#[allow(clippy::too_many_arguments)]
async fn run_refresh(
    pool: &SqlitePool,
    scheduler: &Arc<Scheduler>,
    matrix: &CardMatrix,
    artifact_key: &str,
    source: &str,
    subject_key: &str,
    canonical_input: serde_json::Value,
    mut options: serde_json::Value,
    requested_cards: Vec<String>,
) -> crate::error::Result<()> {
    let claimed = analyze_cache::durable::try_begin_refresh_run(pool, artifact_key)
        .await
        .map_err(crate::error::SchedulerError::Cache)?;
    if !claimed {
        debug!(artifact_key, "background refresh skipped: another run already claimed this artifact key");
        return Ok(());
    }

    if let serde_json::Value::Object(map) = &mut options {
        map.insert("force_refresh".to_string(), serde_json::Value::Bool(true));
    }

    let plan = analyze_plan::build_plan(matrix, source, Some(&requested_cards));
    let result = analyze_store::jobs::create_job_bundle(
        pool,
        "system",
        source,
        Some(subject_key),
        &canonical_input,
        &options,
        &plan,
        None,
        None,
    )
    .await
    .map_err(crate::error::SchedulerError::Store);

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = analyze_cache::durable::fail_refresh_run(pool, artifact_key).await;
            return Err(e);
        }
    };

    if outcome.created {
        scheduler.spawn_job(outcome.job.job.id, source.to_string(), canonical_input, options);
    }
    // The run completes (successfully or not) once the job itself reaches a
    // terminal state; from the refresher's point of view submission is the
    // unit of work, so mark the lock done here rather than awaiting the job.
    analyze_cache::durable::complete_refresh_run(pool, artifact_key).await.ok();
    Ok(())
}
