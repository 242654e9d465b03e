//! Card Scheduler: drives the DAG for one job at a time, across every
//! non-terminal job in the process. One `Scheduler` per process
//! (constructed once, injected — never a module-level global). Dispatch
//! polls ready work, backs off exponentially with jitter when nothing is
//! claimable, and resets on any dispatch; within a job it claims every
//! ready card whose group has a free permit, highest priority first,
//! ties by insertion order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use analyze_protocol::{
    Card, CardId, CardOutput, CardStatus, EventType, JobId, JobStatus, RetryPolicy, SchedulerConfig,
};
use dashmap::DashMap;
use rand::Rng;
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ExecutorError, Result as SchedulerResult, SchedulerError};
use crate::executor::{CardContext, CardExecutor, ProgressMessage, ProgressSink};
use crate::quality_gate::{QualityGate, QualityGateContext};

const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

fn default_limit_for_group(group: &str, config: &SchedulerConfig) -> usize {
    match group {
        "llm" => config.llm_group_limit,
        "github_api" | "crawlbase" | "apify" | "resource" => config.resource_group_limit,
        _ => config.default_group_limit,
    }
}

pub struct Scheduler {
    pool: SqlitePool,
    executor: Arc<dyn CardExecutor>,
    quality_gate: Arc<dyn QualityGate>,
    group_semaphores: DashMap<String, Arc<Semaphore>>,
    worker_permits: Arc<Semaphore>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    shutdown: AtomicBool,
    /// Per-job cancellation signal, a first-class value handed to both
    /// the dispatch loop and every in-flight `CardContext` for that job
    /// — not a single process-wide flag. Entries are removed once the
    /// job's dispatch loop exits.
    job_tokens: DashMap<JobId, CancellationToken>,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        executor: Arc<dyn CardExecutor>,
        quality_gate: Arc<dyn QualityGate>,
        config: SchedulerConfig,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let worker_permits = Arc::new(Semaphore::new(config.max_workers));
        Arc::new(Self {
            pool,
            executor,
            quality_gate,
            group_semaphores: DashMap::new(),
            worker_permits,
            config,
            retry,
            shutdown: AtomicBool::new(false),
            job_tokens: DashMap::new(),
        })
    }

    /// Stop dispatching further cards on every job's loop. In-flight cards
    /// already claimed keep running to completion; jobs remain resumable
    /// on the next `Scheduler` (nothing here marks them cancelled).
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn job_token(&self, job_id: JobId) -> CancellationToken {
        self.job_tokens.entry(job_id).or_insert_with(CancellationToken::new).clone()
    }

    /// Cancel one job: stop dispatching further cards for it, finalize it
    /// as `cancelled`, and fire its cancellation token so any card
    /// already in flight can cooperate at its next safe point. Returns
    /// `false` if the job was already terminal.
    pub async fn cancel_job(&self, job_id: JobId) -> SchedulerResult<bool> {
        let changed = analyze_store::jobs::cancel_job(&self.pool, job_id)
            .await
            .map_err(SchedulerError::Store)?;
        self.job_token(job_id).cancel();
        if changed {
            if let Err(e) = analyze_store::events::append_event(
                &self.pool,
                job_id,
                None,
                EventType::JobCompleted { status: JobStatus::Cancelled, cache: None },
            )
            .await
            {
                error!(job_id = %job_id, error = %e, "failed to emit job.cancelled terminal event");
            }
            info!(job_id = %job_id, "job cancelled");
        }
        Ok(changed)
    }

    fn group_semaphore(&self, group: &str) -> Arc<Semaphore> {
        self.group_semaphores
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(default_limit_for_group(group, &self.config).max(1))))
            .clone()
    }

    fn max_retries_for(&self, card: &Card) -> i32 {
        if card.card_type.starts_with("resource.") {
            self.retry.max_retries_resource
        } else if card.concurrency_group == "llm" {
            self.retry.max_retries_ai
        } else {
            self.retry.max_retries_base
        }
    }

    /// Spawn the per-job dispatch loop. Resumable: on restart this simply
    /// re-reads `ready` cards for the job, same as a fresh start.
    pub fn spawn_job(
        self: &Arc<Self>,
        job_id: JobId,
        source: String,
        input: serde_json::Value,
        options: serde_json::Value,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_loop(job_id, source, input, options).await })
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        job_id: JobId,
        source: String,
        input: serde_json::Value,
        options: serde_json::Value,
    ) {
        self.dispatch_loop_inner(job_id, source, input, options).await;
        self.job_tokens.remove(&job_id);
    }

    async fn dispatch_loop_inner(
        self: &Arc<Self>,
        job_id: JobId,
        source: String,
        input: serde_json::Value,
        options: serde_json::Value,
    ) {
        let token = self.job_token(job_id);
        let mut backoff = MIN_BACKOFF;
        loop {
            if self.shutdown.load(Ordering::Relaxed) || token.is_cancelled() {
                return;
            }
            let job = match analyze_store::jobs::get_job(&self.pool, job_id).await {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "dispatch loop: job lookup failed, stopping");
                    return;
                }
            };
            if job.status.is_terminal() {
                return;
            }

            if let Err(e) = analyze_store::jobs::release_ready_cards(&self.pool, job_id).await {
                error!(job_id = %job_id, error = %e, "release_ready_cards failed");
            }

            let with_cards = match analyze_store::jobs::get_job_with_cards(&self.pool, job_id).await {
                Ok(wc) => wc,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "get_job_with_cards failed, stopping");
                    return;
                }
            };

            let mut ready: Vec<Card> = with_cards
                .cards
                .into_iter()
                .filter(|c| c.status == CardStatus::Ready)
                .collect();
            ready.sort_by(|a, b| b.priority.cmp(&a.priority));

            let mut claimed_any = false;
            for card in ready {
                let group_sem = self.group_semaphore(&card.concurrency_group);
                let group_permit = match group_sem.try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => continue,
                };
                let worker_permit = match Arc::clone(&self.worker_permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => continue,
                };
                if !try_claim_running(&self.pool, card.id).await.unwrap_or(false) {
                    continue;
                }
                claimed_any = true;
                let this = Arc::clone(self);
                let source = source.clone();
                let input = input.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    this.run_card(job_id, card, source, input, options, group_permit, worker_permit)
                        .await;
                });
            }

            if claimed_any {
                backoff = MIN_BACKOFF;
            } else {
                let jitter_ms: u64 = rand::thread_rng().gen_range(0..50);
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_card(
        self: Arc<Self>,
        job_id: JobId,
        card: Card,
        source: String,
        input: serde_json::Value,
        options: serde_json::Value,
        _group_permit: OwnedSemaphorePermit,
        _worker_permit: OwnedSemaphorePermit,
    ) {
        let token = self.job_token(job_id);
        if token.is_cancelled() {
            self.on_card_errored(job_id, card, ExecutorError::Cancelled).await;
            self.after_card_terminal(job_id).await;
            return;
        }

        if let Err(e) = analyze_store::events::append_event(
            &self.pool,
            job_id,
            Some(card.id),
            EventType::CardStarted { card: card.card_type.clone() },
        )
        .await
        {
            error!(job_id = %job_id, card = %card.card_type, error = %e, "failed to emit card.started");
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressMessage>();
        let progress_pool = self.pool.clone();
        let progress_card = card.clone();
        let progress_job_id = job_id;
        let progress_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let event_type = match message {
                    ProgressMessage::Progress(p) => EventType::CardProgress {
                        card: progress_card.card_type.clone(),
                        step: p.step,
                        message: p.message,
                        data: p.data,
                    },
                    ProgressMessage::Delta { delta } => EventType::CardDelta {
                        card: progress_card.card_type.clone(),
                        delta,
                    },
                    ProgressMessage::Append { path, items, dedup_key, partial } => EventType::CardAppend {
                        card: progress_card.card_type.clone(),
                        path,
                        items,
                        dedup_key,
                        partial,
                    },
                };
                if let Err(e) = analyze_store::events::append_event(&progress_pool, progress_job_id, Some(progress_card.id), event_type).await {
                    warn!(error = %e, "failed to emit progress event");
                }
            }
        });

        let ctx = CardContext {
            job_id,
            card_id: card.id,
            card_type: card.card_type.clone(),
            source: source.clone(),
            input,
            options,
            pool: self.pool.clone(),
            cancellation: token,
        };
        let sink = ProgressSink::new(tx);
        let outcome = self.executor.execute_card(&ctx, sink).await;
        drop(ctx);
        let _ = progress_task.await;

        match outcome {
            Ok(payload) => self.on_card_succeeded(job_id, card, &source, payload).await,
            Err(e) => self.on_card_errored(job_id, card, e).await,
        }

        self.after_card_terminal(job_id).await;
    }

    async fn on_card_succeeded(&self, job_id: JobId, card: Card, source: &str, payload: serde_json::Value) {
        let internal = analyze_protocol::is_internal_card_type(&card.card_type);

        if internal {
            if card.card_type == "full_report" {
                let _ = analyze_store::jobs::update_card_status(&self.pool, card.id, CardStatus::Skipped, None, None).await;
                return;
            }
            // `resource.*` executors write their own payload via
            // `CardContext::write_artifact`; the scheduler only tracks
            // completion, it never touches the Artifact Store itself.
            let _ = payload;
            let _ = analyze_store::jobs::update_card_status(&self.pool, card.id, CardStatus::Completed, None, None).await;
            return;
        }

        let gate_ctx = QualityGateContext { job_id, full_report: None };
        let verdict = self.quality_gate.check(source, &card.card_type, &payload, &gate_ctx);

        if verdict.is_accept() {
            let output = CardOutput { data: Some(verdict.normalized.clone()), stream: Default::default() };
            let _ = analyze_store::jobs::update_card_status(&self.pool, card.id, CardStatus::Completed, Some(&output), None).await;
            let _ = analyze_store::events::append_event(
                &self.pool,
                job_id,
                Some(card.id),
                EventType::CardCompleted {
                    card: card.card_type.clone(),
                    payload: output,
                    internal: false,
                    cache: None,
                },
            )
            .await;
        } else {
            self.retry_or_fail(job_id, card, verdict.issue.unwrap_or_else(|| "quality gate rejected".into()), true)
                .await;
        }
    }

    async fn on_card_errored(&self, job_id: JobId, card: Card, err: crate::error::ExecutorError) {
        if matches!(err, ExecutorError::Cancelled) {
            self.fail_card(job_id, card, "cancelled", err.message().to_string(), false).await;
            return;
        }
        self.retry_or_fail(job_id, card, err.message().to_string(), err.is_retryable()).await;
    }

    async fn retry_or_fail(&self, job_id: JobId, card: Card, message: String, retryable: bool) {
        let max_retries = self.max_retries_for(&card);
        if retryable && card.retry_count < max_retries {
            let _ = analyze_store::jobs::update_card_status(
                &self.pool,
                card.id,
                CardStatus::Ready,
                None,
                Some(card.retry_count + 1),
            )
            .await;
            return;
        }

        let code = if retryable { "upstream_transient" } else { "quality_gate_rejected" };
        self.fail_card(job_id, card, code, message, retryable).await;
    }

    /// Mark `card` terminally `failed` and emit `card.failed`. Shared by
    /// retry exhaustion, quality-gate rejection and cancellation — only
    /// the error code and message differ.
    async fn fail_card(&self, job_id: JobId, card: Card, code: &str, message: String, retryable: bool) {
        let _ = analyze_store::jobs::update_card_status(&self.pool, card.id, CardStatus::Failed, None, None).await;
        let card_error = analyze_protocol::CardError { code: code.to_string(), message, retryable };
        let _ = analyze_store::events::append_event(
            &self.pool,
            job_id,
            Some(card.id),
            EventType::CardFailed { card: card.card_type.clone(), error: card_error },
        )
        .await;
        let _ = analyze_store::jobs::mark_dependent_cards_skipped(&self.pool, job_id, &card.card_type).await;
    }

    /// Called after any card reaches a terminal state: release newly
    /// unblocked cards once, then finalize the job if nothing remains in
    /// flight.
    async fn after_card_terminal(&self, job_id: JobId) {
        if let Err(e) = analyze_store::jobs::release_ready_cards(&self.pool, job_id).await {
            error!(job_id = %job_id, error = %e, "release_ready_cards failed after card terminal");
            return;
        }

        let counts = match analyze_store::jobs::count_cards_by_status(&self.pool, job_id).await {
            Ok(c) => c,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "count_cards_by_status failed");
                return;
            }
        };
        let in_flight = count_of(&counts, CardStatus::Pending) + count_of(&counts, CardStatus::Ready) + count_of(&counts, CardStatus::Running);
        if in_flight > 0 {
            return;
        }

        let failed = count_of(&counts, CardStatus::Failed) + count_of(&counts, CardStatus::Timeout);
        let completed = count_of(&counts, CardStatus::Completed);
        let final_status = if failed == 0 {
            JobStatus::Completed
        } else if completed > 0 {
            JobStatus::Partial
        } else {
            JobStatus::Failed
        };

        match analyze_store::jobs::try_finalize_job(&self.pool, job_id, final_status).await {
            Ok(true) => {
                let event_type = if final_status == JobStatus::Failed {
                    EventType::JobFailed { status: final_status }
                } else {
                    EventType::JobCompleted { status: final_status, cache: None }
                };
                if let Err(e) = analyze_store::events::append_event(&self.pool, job_id, None, event_type).await {
                    error!(job_id = %job_id, error = %e, "failed to emit job-terminal event");
                }
                info!(job_id = %job_id, status = %final_status, "job finalized");
            }
            Ok(false) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "try_finalize_job failed"),
        }
    }
}

fn count_of(counts: &HashMap<CardStatus, i64>, status: CardStatus) -> i64 {
    counts.get(&status).copied().unwrap_or(0)
}

/// CAS: `ready -> running`, skipping the card if another worker claimed it
/// first.
async fn try_claim_running(pool: &SqlitePool, card_id: CardId) -> Result<bool, sqlx::Error> {
    let row: Option<i64> = sqlx::query(
        "UPDATE cards SET status = 'running' WHERE id = ?1 AND status = 'ready' RETURNING id",
    )
    .bind(card_id.as_i64())
    .fetch_optional(pool)
    .await?
    .map(|row| row.try_get::<i64, _>("id"))
    .transpose()?;
    Ok(row.is_some())
}
