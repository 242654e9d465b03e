//! Engine facade: wires the Job/Event/Artifact Store, the two cache
//! tiers, the planner and the scheduler into one object a binary can hold
//! onto, built in `main` and handed to the CLI rather than a god object
//! with its own runtime.

pub mod demo_executor;

use std::sync::Arc;

use analyze_protocol::{JobId, JobWithCards, SystemConfig};
use analyze_scheduler::{BackgroundRefresher, CardExecutor, QualityGate, Scheduler};
use futures::Stream;
use sqlx::SqlitePool;

pub use analyze_protocol::Event;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] analyze_db::DbError),

    #[error("store error: {0}")]
    Store(#[from] analyze_store::StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] analyze_scheduler::SchedulerError),

    #[error("cache error: {0}")]
    Cache(#[from] analyze_cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Default Local KV Cache file, alongside the rest of the engine's
/// on-disk state, when `SchedulerConfig::local_cache_path` is unset.
fn default_local_cache_url() -> String {
    let path = analyze_logging::analyze_home().join("local_cache.db");
    format!("sqlite://{}", path.display())
}

/// Request to create (or resolve, via cache/idempotency) a job.
pub struct SubmitRequest {
    pub user_id: String,
    pub source: String,
    pub subject_key: String,
    pub input: serde_json::Value,
    pub options: serde_json::Value,
    pub requested_cards: Option<Vec<String>>,
    pub idempotency_key: Option<String>,
    pub force_refresh: bool,
}

pub struct SubmitResponse {
    pub job: JobWithCards,
    pub cache_hit: bool,
    pub cache_stale: bool,
}

pub struct Engine {
    pool: SqlitePool,
    scheduler: Arc<Scheduler>,
    matrix: Arc<analyze_plan::CardMatrix>,
    local_cache: Option<analyze_cache::LocalKvCache>,
    refresher: Option<Arc<BackgroundRefresher>>,
    quality_gate: Arc<dyn QualityGate>,
    config: SystemConfig,
}

impl Engine {
    pub async fn bootstrap(
        config: SystemConfig,
        executor: Arc<dyn CardExecutor>,
        quality_gate: Arc<dyn QualityGate>,
    ) -> Result<Self> {
        let pool = analyze_db::create_pool(analyze_db::DbConfig::new(&config.database_url)).await?;
        analyze_db::run_migrations(&pool).await?;

        let matrix = Arc::new(analyze_plan::default_matrix());
        let scheduler = Scheduler::new(
            pool.clone(),
            Arc::clone(&executor),
            Arc::clone(&quality_gate),
            config.scheduler.clone(),
            config.retry,
        );

        let local_cache = if config.scheduler.local_cache_enabled {
            let url = config
                .scheduler
                .local_cache_path
                .clone()
                .unwrap_or_else(default_local_cache_url);
            Some(analyze_cache::LocalKvCache::open(&url, 64 * 1024 * 1024).await?)
        } else {
            None
        };
        if let Some(cache) = &local_cache {
            cache.spawn_eviction_task(std::time::Duration::from_secs(30));
        }

        let refresher = Some(Arc::new(BackgroundRefresher::new(
            pool.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&matrix),
            config.background_refresh,
        )));

        Ok(Self { pool, scheduler, matrix, local_cache, refresher, quality_gate, config })
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitResponse> {
        let requested_cards = analyze_plan::normalize_cards(&self.matrix, &req.source, req.requested_cards.as_deref());
        let options_hash = analyze_protocol::compute_options_hash(&req.options);
        let request_hash = req.idempotency_key.as_ref().map(|_| {
            analyze_protocol::compute_request_hash(&req.source, &req.input, &requested_cards, &req.options)
        });

        if !req.force_refresh {
            let fast_path_req = analyze_scheduler::fast_path::FastPathRequest {
                user_id: &req.user_id,
                source: &req.source,
                subject_key: &req.subject_key,
                canonical_input: &req.input,
                options: &req.options,
                requested_cards: &requested_cards,
                pipeline_version: &self.config.scheduler.pipeline_version,
                options_hash: &options_hash,
                idempotency_key: req.idempotency_key.as_deref(),
                request_hash: request_hash.as_deref(),
            };
            if let Some(outcome) = analyze_scheduler::fast_path::try_fast_path(
                &self.pool,
                self.quality_gate.as_ref(),
                self.local_cache.as_ref(),
                self.refresher.as_deref(),
                &fast_path_req,
            )
            .await?
            {
                return Ok(SubmitResponse {
                    job: outcome.job,
                    cache_hit: true,
                    cache_stale: outcome.cache_stale,
                });
            }
        }

        let plan = analyze_plan::build_plan(&self.matrix, &req.source, Some(&requested_cards));
        let outcome = analyze_store::jobs::create_job_bundle(
            &self.pool,
            &req.user_id,
            &req.source,
            Some(&req.subject_key),
            &req.input,
            &req.options,
            &plan,
            req.idempotency_key.as_deref(),
            request_hash.as_deref(),
        )
        .await?;

        if outcome.created {
            self.scheduler.spawn_job(outcome.job.job.id, req.source.clone(), req.input.clone(), req.options.clone());
        }

        Ok(SubmitResponse { job: outcome.job, cache_hit: false, cache_stale: false })
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<JobWithCards> {
        Ok(analyze_store::jobs::get_job_with_cards(&self.pool, job_id).await?)
    }

    /// Cancel one job externally: stop dispatching further cards for it
    /// and finalize it as `cancelled`. Returns `false` if the job had
    /// already reached a terminal status.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        Ok(self.scheduler.cancel_job(job_id).await?)
    }

    pub fn stream_job(&self, job_id: JobId, after_seq: i64) -> impl Stream<Item = std::result::Result<Event, analyze_store::StoreError>> {
        analyze_store::events::stream_events(self.pool.clone(), job_id, after_seq, true)
    }

    /// Persist a job's terminal `final_result` into the Analysis Cache,
    /// for callers (tests, offline seeding) that want to prime a cache hit
    /// without running the DAG.
    pub async fn seed_final_result(
        &self,
        source: &str,
        subject_key: &str,
        canonical_input: &serde_json::Value,
        options: &serde_json::Value,
        cards: &std::collections::BTreeMap<String, serde_json::Value>,
        ttl_secs: i64,
    ) -> Result<()> {
        let subject_id = analyze_cache::durable::get_or_create_subject(&self.pool, source, subject_key, canonical_input).await?;
        let options_hash = analyze_protocol::compute_options_hash(options);
        let payload = serde_json::to_value(analyze_protocol::FinalResult { cards: cards.clone() })?;
        analyze_cache::durable::save_full_report(
            &self.pool,
            subject_id,
            &self.config.scheduler.pipeline_version,
            &options_hash,
            None,
            &payload,
            ttl_secs,
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyze_protocol::JobStatus;
    use futures::StreamExt;

    async fn test_engine() -> Engine {
        let config = SystemConfig {
            database_url: "sqlite::memory:".to_string(),
            ..SystemConfig::default()
        };
        let executor = Arc::new(crate::demo_executor::EchoExecutor);
        let gate = Arc::new(crate::demo_executor::PassthroughGate);
        Engine::bootstrap(config, executor, gate).await.unwrap()
    }

    async fn drain_to_terminal(engine: &Engine, job_id: JobId) -> JobWithCards {
        let mut stream = Box::pin(engine.stream_job(job_id, 0));
        while let Some(event) = stream.next().await {
            let event = event.unwrap();
            if event.event_type.is_job_terminal() {
                break;
            }
        }
        engine.get_job(job_id).await.unwrap()
    }

    #[tokio::test]
    async fn submit_without_cache_runs_dag_to_completion() {
        let engine = test_engine().await;
        let response = engine
            .submit(SubmitRequest {
                user_id: "u1".to_string(),
                source: "huggingface".to_string(),
                subject_key: "id:demo-model".to_string(),
                input: serde_json::json!({"content": "demo-model"}),
                options: serde_json::json!({}),
                requested_cards: None,
                idempotency_key: None,
                force_refresh: false,
            })
            .await
            .unwrap();
        assert!(!response.cache_hit);

        let finished = drain_to_terminal(&engine, response.job.job.id).await;
        assert_eq!(finished.job.status, JobStatus::Completed);
        let profile = finished.cards.iter().find(|c| c.card_type == "profile").unwrap();
        assert!(profile.output.data.is_some());
    }

    #[tokio::test]
    async fn idempotency_key_replay_returns_the_same_job() {
        let engine = test_engine().await;
        let req = || SubmitRequest {
            user_id: "u1".to_string(),
            source: "huggingface".to_string(),
            subject_key: "id:demo-model".to_string(),
            input: serde_json::json!({"content": "demo-model"}),
            options: serde_json::json!({}),
            requested_cards: None,
            idempotency_key: Some("replay-key".to_string()),
            force_refresh: false,
        };

        let first = engine.submit(req()).await.unwrap();
        let second = engine.submit(req()).await.unwrap();
        assert_eq!(first.job.job.id, second.job.job.id);
    }

    #[tokio::test]
    async fn seeded_final_result_is_served_from_the_fast_path() {
        let engine = test_engine().await;
        let mut cards = std::collections::BTreeMap::new();
        cards.insert("profile".to_string(), serde_json::json!({"name": "demo"}));
        cards.insert("summary".to_string(), serde_json::json!({"text": "a summary"}));

        engine
            .seed_final_result(
                "huggingface",
                "id:demo-model",
                &serde_json::json!({"content": "demo-model"}),
                &serde_json::json!({}),
                &cards,
                3600,
            )
            .await
            .unwrap();

        let response = engine
            .submit(SubmitRequest {
                user_id: "u1".to_string(),
                source: "huggingface".to_string(),
                subject_key: "id:demo-model".to_string(),
                input: serde_json::json!({"content": "demo-model"}),
                options: serde_json::json!({}),
                requested_cards: None,
                idempotency_key: None,
                force_refresh: false,
            })
            .await
            .unwrap();

        assert!(response.cache_hit);
        assert!(!response.cache_stale);
        let profile = response.job.cards.iter().find(|c| c.card_type == "profile").unwrap();
        assert_eq!(profile.output.data, Some(serde_json::json!({"name": "demo"})));
    }

    #[tokio::test]
    async fn force_refresh_bypasses_a_seeded_cache_hit() {
        let engine = test_engine().await;
        let mut cards = std::collections::BTreeMap::new();
        cards.insert("profile".to_string(), serde_json::json!({"name": "demo"}));
        cards.insert("summary".to_string(), serde_json::json!({"text": "a summary"}));

        engine
            .seed_final_result(
                "huggingface",
                "id:demo-model",
                &serde_json::json!({"content": "demo-model"}),
                &serde_json::json!({}),
                &cards,
                3600,
            )
            .await
            .unwrap();

        let response = engine
            .submit(SubmitRequest {
                user_id: "u1".to_string(),
                source: "huggingface".to_string(),
                subject_key: "id:demo-model".to_string(),
                input: serde_json::json!({"content": "demo-model"}),
                options: serde_json::json!({}),
                requested_cards: None,
                idempotency_key: None,
                force_refresh: true,
            })
            .await
            .unwrap();

        assert!(!response.cache_hit);
        let finished = drain_to_terminal(&engine, response.job.job.id).await;
        assert_eq!(finished.job.status, JobStatus::Completed);
    }
}
