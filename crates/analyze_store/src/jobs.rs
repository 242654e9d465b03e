//! Job Store: persistent record of jobs, cards, plan and status.
//!
//! Mutating operations that touch more than one row run inside an explicit
//! `pool.begin()` transaction; sqlite's single-writer lock makes the
//! read-then-conditional-insert used for idempotency replay race-free
//! without a separate advisory lock.

use std::collections::BTreeSet;

use analyze_protocol::{Card, CardId, CardSpec, CardStatus, Job, JobId, JobStatus, JobWithCards};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::{Result, StoreError};

fn parse_depends_on(raw: &str) -> BTreeSet<String> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .into_iter()
        .collect()
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: JobId::new(row.try_get::<i64, _>("id")?),
        user_id: row.try_get("user_id")?,
        source: row.try_get("source")?,
        subject_key: row.try_get("subject_key")?,
        input: serde_json::from_str(row.try_get::<&str, _>("input")?)?,
        options: serde_json::from_str(row.try_get::<&str, _>("options")?)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Db(analyze_db::DbError::invalid_state(format!("bad job status {status}"))))?,
        last_seq: row.try_get("last_seq")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        idempotency_key: row.try_get("idempotency_key")?,
        request_hash: row.try_get("request_hash")?,
    })
}

fn row_to_card(row: &sqlx::sqlite::SqliteRow) -> Result<Card> {
    let status: String = row.try_get("status")?;
    let output_raw: String = row.try_get("output")?;
    Ok(Card {
        id: CardId::new(row.try_get::<i64, _>("id")?),
        job_id: JobId::new(row.try_get::<i64, _>("job_id")?),
        card_type: row.try_get("card_type")?,
        status: CardStatus::parse(&status)
            .ok_or_else(|| StoreError::Db(analyze_db::DbError::invalid_state(format!("bad card status {status}"))))?,
        depends_on: parse_depends_on(row.try_get::<&str, _>("depends_on")?),
        priority: row.try_get("priority")?,
        concurrency_group: row.try_get("concurrency_group")?,
        retry_count: row.try_get("retry_count")?,
        output: serde_json::from_str(&output_raw)?,
        internal: row.try_get::<i64, _>("internal")? != 0,
    })
}

/// Result of `create_job_bundle`: the job (possibly pre-existing, via
/// idempotency replay) plus whether this call actually created it.
pub struct CreateJobOutcome {
    pub job: JobWithCards,
    pub created: bool,
}

/// Shared by `create_job_bundle` and `create_completed_job_bundle`: if a
/// prior job already owns `(user_id, idempotency_key)`, returns its id
/// (after checking `request_hash` matches); `Ok(None)` means no replay
/// candidate exists and the caller should proceed to insert.
async fn find_idempotent_replay(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    idempotency_key: Option<&str>,
    request_hash: Option<&str>,
) -> Result<Option<JobId>> {
    let Some(key) = idempotency_key else { return Ok(None) };
    let existing = sqlx::query("SELECT id, request_hash FROM jobs WHERE user_id = ?1 AND idempotency_key = ?2")
        .bind(user_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(analyze_db::DbError::from)?;

    let Some(row) = existing else { return Ok(None) };
    let existing_hash: Option<String> = row.try_get("request_hash")?;
    if existing_hash.as_deref() != request_hash {
        return Err(StoreError::IdempotencyConflict(user_id.to_string()));
    }
    Ok(Some(JobId::new(row.try_get::<i64, _>("id")?)))
}

#[allow(clippy::too_many_arguments)]
pub async fn create_job_bundle(
    pool: &SqlitePool,
    user_id: &str,
    source: &str,
    subject_key: Option<&str>,
    input: &serde_json::Value,
    options: &serde_json::Value,
    cards: &[CardSpec],
    idempotency_key: Option<&str>,
    request_hash: Option<&str>,
) -> Result<CreateJobOutcome> {
    let mut tx = pool.begin().await.map_err(analyze_db::DbError::from)?;

    if let Some(id) = find_idempotent_replay(&mut tx, user_id, idempotency_key, request_hash).await? {
        tx.commit().await.map_err(analyze_db::DbError::from)?;
        let job = get_job_with_cards(pool, id).await?;
        return Ok(CreateJobOutcome { job, created: false });
    }

    let now = Utc::now();
    let input_raw = serde_json::to_string(input)?;
    let options_raw = serde_json::to_string(options)?;

    let job_id: i64 = sqlx::query_scalar(
        "INSERT INTO jobs (user_id, source, subject_key, input, options, status, last_seq, created_at, updated_at, idempotency_key, request_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, ?6, ?6, ?7, ?8)
         RETURNING id",
    )
    .bind(user_id)
    .bind(source)
    .bind(subject_key)
    .bind(&input_raw)
    .bind(&options_raw)
    .bind(now)
    .bind(idempotency_key)
    .bind(request_hash)
    .fetch_one(&mut *tx)
    .await
    .map_err(analyze_db::DbError::from)?;

    for spec in cards {
        let depends_on_raw = serde_json::to_string(&spec.depends_on)?;
        let internal = analyze_protocol::is_internal_card_type(&spec.card_type);
        sqlx::query(
            "INSERT INTO cards (job_id, card_type, status, depends_on, priority, concurrency_group, retry_count, output, internal)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, 0, '{}', ?6)",
        )
        .bind(job_id)
        .bind(&spec.card_type)
        .bind(&depends_on_raw)
        .bind(spec.priority)
        .bind(&spec.concurrency_group)
        .bind(internal as i64)
        .execute(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?;
    }

    tx.commit().await.map_err(analyze_db::DbError::from)?;

    let job = get_job_with_cards(pool, JobId::new(job_id)).await?;
    Ok(CreateJobOutcome { job, created: true })
}

pub async fn get_job(pool: &SqlitePool, job_id: JobId) -> Result<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
        .bind(job_id.as_i64())
        .fetch_optional(pool)
        .await
        .map_err(analyze_db::DbError::from)?
        .ok_or(StoreError::JobNotFound(job_id))?;
    row_to_job(&row)
}

pub async fn get_job_with_cards(pool: &SqlitePool, job_id: JobId) -> Result<JobWithCards> {
    let job = get_job(pool, job_id).await?;
    let rows = sqlx::query("SELECT * FROM cards WHERE job_id = ?1 ORDER BY id")
        .bind(job_id.as_i64())
        .fetch_all(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    let cards = rows.iter().map(row_to_card).collect::<Result<Vec<_>>>()?;
    Ok(JobWithCards { job, cards })
}

/// Merge `patch` into a card's `{data, stream}` output envelope and persist
/// the new status/retry_count, returning the merged card.
pub async fn update_card_status(
    pool: &SqlitePool,
    card_id: CardId,
    status: CardStatus,
    output_patch: Option<&analyze_protocol::CardOutput>,
    retry_count: Option<i32>,
) -> Result<Card> {
    let mut tx = pool.begin().await.map_err(analyze_db::DbError::from)?;
    let row = sqlx::query("SELECT * FROM cards WHERE id = ?1")
        .bind(card_id.as_i64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?
        .ok_or_else(|| StoreError::CardNotFound(card_id.to_string(), JobId::new(0)))?;
    let mut card = row_to_card(&row)?;

    if let Some(patch) = output_patch {
        if let Some(data) = &patch.data {
            card.output.data = Some(data.clone());
        }
        for (k, v) in &patch.stream {
            card.output.stream.insert(k.clone(), v.clone());
        }
    }
    card.status = status;
    if let Some(rc) = retry_count {
        card.retry_count = rc;
    }

    let output_raw = serde_json::to_string(&card.output)?;
    sqlx::query("UPDATE cards SET status = ?1, output = ?2, retry_count = ?3 WHERE id = ?4")
        .bind(status.as_str())
        .bind(&output_raw)
        .bind(card.retry_count)
        .bind(card_id.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?;

    tx.commit().await.map_err(analyze_db::DbError::from)?;
    Ok(card)
}

/// Promote every `pending` card whose dependencies are all in
/// `{completed, skipped}` to `ready`. Idempotent.
pub async fn release_ready_cards(pool: &SqlitePool, job_id: JobId) -> Result<Vec<Card>> {
    let rows = sqlx::query("SELECT * FROM cards WHERE job_id = ?1")
        .bind(job_id.as_i64())
        .fetch_all(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    let cards = rows.iter().map(row_to_card).collect::<Result<Vec<_>>>()?;

    let satisfied: std::collections::HashMap<&str, bool> = cards
        .iter()
        .map(|c| (c.card_type.as_str(), c.status.satisfies_dependency()))
        .collect();

    let mut released = Vec::new();
    for card in &cards {
        if card.status != CardStatus::Pending {
            continue;
        }
        let all_deps_done = card
            .depends_on
            .iter()
            .all(|dep| satisfied.get(dep.as_str()).copied().unwrap_or(false));
        if all_deps_done {
            sqlx::query("UPDATE cards SET status = 'ready' WHERE id = ?1")
                .bind(card.id.as_i64())
                .execute(pool)
                .await
                .map_err(analyze_db::DbError::from)?;
            let mut promoted = card.clone();
            promoted.status = CardStatus::Ready;
            released.push(promoted);
        }
    }
    Ok(released)
}

/// Transitive closure over `depends_on`: cards that (directly or
/// transitively) depend on `failed_card_type` move to `skipped`.
pub async fn mark_dependent_cards_skipped(
    pool: &SqlitePool,
    job_id: JobId,
    failed_card_type: &str,
) -> Result<Vec<Card>> {
    let rows = sqlx::query("SELECT * FROM cards WHERE job_id = ?1")
        .bind(job_id.as_i64())
        .fetch_all(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    let cards = rows.iter().map(row_to_card).collect::<Result<Vec<_>>>()?;

    let mut doomed: BTreeSet<String> = BTreeSet::new();
    doomed.insert(failed_card_type.to_string());
    loop {
        let mut grew = false;
        for card in &cards {
            if card.status.is_terminal() {
                continue;
            }
            if doomed.contains(&card.card_type) {
                continue;
            }
            if card.depends_on.iter().any(|d| doomed.contains(d)) {
                doomed.insert(card.card_type.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    doomed.remove(failed_card_type);

    let mut skipped = Vec::new();
    for card in &cards {
        if doomed.contains(&card.card_type) && !card.status.is_terminal() {
            sqlx::query("UPDATE cards SET status = 'skipped' WHERE id = ?1")
                .bind(card.id.as_i64())
                .execute(pool)
                .await
                .map_err(analyze_db::DbError::from)?;
            let mut s = card.clone();
            s.status = CardStatus::Skipped;
            skipped.push(s);
        }
    }
    Ok(skipped)
}

pub async fn count_cards_by_status(
    pool: &SqlitePool,
    job_id: JobId,
) -> Result<std::collections::HashMap<CardStatus, i64>> {
    let rows = sqlx::query("SELECT status, COUNT(*) as n FROM cards WHERE job_id = ?1 GROUP BY status")
        .bind(job_id.as_i64())
        .fetch_all(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    let mut out = std::collections::HashMap::new();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        if let Some(parsed) = CardStatus::parse(&status) {
            out.insert(parsed, n);
        }
    }
    Ok(out)
}

/// CAS: only transitions a non-terminal job to a terminal status, via
/// `UPDATE ... WHERE status NOT IN (...) RETURNING id`.
pub async fn try_finalize_job(pool: &SqlitePool, job_id: JobId, status: JobStatus) -> Result<bool> {
    let row: Option<i64> = sqlx::query_scalar(
        "UPDATE jobs SET status = ?1, updated_at = ?2
         WHERE id = ?3 AND status NOT IN ('completed', 'partial', 'failed', 'cancelled')
         RETURNING id",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(job_id.as_i64())
    .fetch_optional(pool)
    .await
    .map_err(analyze_db::DbError::from)?;
    Ok(row.is_some())
}

/// CAS: cancel a job externally. Only transitions a non-terminal job to
/// `cancelled`; returns `false` if it had already reached a terminal
/// status. Cards already claimed are left as-is — the scheduler's own
/// cancellation signal is what stops them, this call only owns the job
/// row.
pub async fn cancel_job(pool: &SqlitePool, job_id: JobId) -> Result<bool> {
    try_finalize_job(pool, job_id, JobStatus::Cancelled).await
}

/// A business card already resolved from a cache hit, ready to be written
/// as `completed` at job-creation time.
pub struct CompletedCard {
    pub card_type: String,
    pub output: analyze_protocol::CardOutput,
    pub cache: analyze_protocol::CacheInfo,
}

/// Cache-hit fast path step 4: synthesize an already-`completed` job
/// from cached cards in one transaction — job row, card rows, every
/// `card.completed` event and the single `job.completed` event all commit
/// together, so a subscriber can never observe a partial snapshot.
pub async fn create_completed_job_bundle(
    pool: &SqlitePool,
    user_id: &str,
    source: &str,
    subject_key: Option<&str>,
    input: &serde_json::Value,
    options: &serde_json::Value,
    cards: &[CompletedCard],
    idempotency_key: Option<&str>,
    request_hash: Option<&str>,
) -> Result<CreateJobOutcome> {
    let mut tx = pool.begin().await.map_err(analyze_db::DbError::from)?;

    if let Some(id) = find_idempotent_replay(&mut tx, user_id, idempotency_key, request_hash).await? {
        tx.commit().await.map_err(analyze_db::DbError::from)?;
        let job = get_job_with_cards(pool, id).await?;
        return Ok(CreateJobOutcome { job, created: false });
    }

    let now = Utc::now();
    let input_raw = serde_json::to_string(input)?;
    let options_raw = serde_json::to_string(options)?;
    let last_seq = cards.len() as i64 + 1;

    let job_id: i64 = sqlx::query_scalar(
        "INSERT INTO jobs (user_id, source, subject_key, input, options, status, last_seq, created_at, updated_at, idempotency_key, request_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, 'completed', ?6, ?7, ?7, ?8, ?9)
         RETURNING id",
    )
    .bind(user_id)
    .bind(source)
    .bind(subject_key)
    .bind(&input_raw)
    .bind(&options_raw)
    .bind(last_seq)
    .bind(now)
    .bind(idempotency_key)
    .bind(request_hash)
    .fetch_one(&mut *tx)
    .await
    .map_err(analyze_db::DbError::from)?;

    for (index, card) in cards.iter().enumerate() {
        let output_raw = serde_json::to_string(&card.output)?;
        let card_id: i64 = sqlx::query_scalar(
            "INSERT INTO cards (job_id, card_type, status, depends_on, priority, concurrency_group, retry_count, output, internal)
             VALUES (?1, ?2, 'completed', '[]', 0, 'default', 0, ?3, 0)
             RETURNING id",
        )
        .bind(job_id)
        .bind(&card.card_type)
        .bind(&output_raw)
        .fetch_one(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?;

        let event_type = analyze_protocol::EventType::CardCompleted {
            card: card.card_type.clone(),
            payload: card.output.clone(),
            internal: false,
            cache: Some(card.cache.clone()),
        };
        let payload_raw = serde_json::to_string(&event_type)?;
        sqlx::query(
            "INSERT INTO events (job_id, seq, card_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(job_id)
        .bind(index as i64 + 1)
        .bind(card_id)
        .bind(event_type.kind())
        .bind(&payload_raw)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?;
    }

    let job_completed = analyze_protocol::EventType::JobCompleted {
        status: JobStatus::Completed,
        cache: cards.first().map(|c| c.cache.clone()),
    };
    let job_completed_raw = serde_json::to_string(&job_completed)?;
    sqlx::query(
        "INSERT INTO events (job_id, seq, card_id, event_type, payload, created_at)
         VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
    )
    .bind(job_id)
    .bind(last_seq)
    .bind(job_completed.kind())
    .bind(&job_completed_raw)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(analyze_db::DbError::from)?;

    tx.commit().await.map_err(analyze_db::DbError::from)?;
    let job = get_job_with_cards(pool, JobId::new(job_id)).await?;
    Ok(CreateJobOutcome { job, created: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyze_db::{create_pool, run_migrations, DbConfig};

    async fn test_pool() -> SqlitePool {
        let pool = create_pool(DbConfig::in_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn spec(card_type: &str, depends_on: &[&str]) -> CardSpec {
        CardSpec {
            card_type: card_type.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            priority: 0,
            concurrency_group: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn create_job_bundle_inserts_job_and_cards() {
        let pool = test_pool().await;
        let outcome = create_job_bundle(
            &pool,
            "u1",
            "github",
            Some("login:torvalds"),
            &serde_json::json!({"content": "torvalds"}),
            &serde_json::json!({}),
            &[spec("profile", &[]), spec("repos", &["profile"])],
            None,
            None,
        )
        .await
        .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.job.cards.len(), 2);
        assert_eq!(outcome.job.job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn idempotency_replay_returns_same_job_without_recreating() {
        let pool = test_pool().await;
        let first = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[])],
            Some("idem-1"),
            Some("hash-a"),
        )
        .await
        .unwrap();
        let second = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[])],
            Some("idem-1"),
            Some("hash-a"),
        )
        .await
        .unwrap();
        assert!(!second.created);
        assert_eq!(first.job.job.id, second.job.job.id);
    }

    #[tokio::test]
    async fn idempotency_conflict_on_mismatched_hash() {
        let pool = test_pool().await;
        create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[])],
            Some("idem-1"),
            Some("hash-a"),
        )
        .await
        .unwrap();
        let conflict = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[])],
            Some("idem-1"),
            Some("hash-b"),
        )
        .await;
        assert!(matches!(conflict, Err(StoreError::IdempotencyConflict(_))));
    }

    #[tokio::test]
    async fn release_ready_cards_promotes_only_satisfied_deps() {
        let pool = test_pool().await;
        let outcome = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[]), spec("repos", &["profile"])],
            None,
            None,
        )
        .await
        .unwrap();
        let released = release_ready_cards(&pool, outcome.job.job.id).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].card_type, "profile");
    }

    #[tokio::test]
    async fn mark_dependent_cards_skipped_is_transitive() {
        let pool = test_pool().await;
        let outcome = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[
                spec("profile", &[]),
                spec("repos", &["profile"]),
                spec("full_report", &["repos"]),
            ],
            None,
            None,
        )
        .await
        .unwrap();
        let skipped = mark_dependent_cards_skipped(&pool, outcome.job.job.id, "profile")
            .await
            .unwrap();
        let mut types: Vec<_> = skipped.iter().map(|c| c.card_type.clone()).collect();
        types.sort();
        assert_eq!(types, vec!["full_report", "repos"]);
    }

    #[tokio::test]
    async fn try_finalize_job_is_cas() {
        let pool = test_pool().await;
        let outcome = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[])],
            None,
            None,
        )
        .await
        .unwrap();
        let first = try_finalize_job(&pool, outcome.job.job.id, JobStatus::Completed)
            .await
            .unwrap();
        let second = try_finalize_job(&pool, outcome.job.job.id, JobStatus::Failed)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn cancel_job_transitions_queued_job_and_is_idempotent() {
        let pool = test_pool().await;
        let outcome = create_job_bundle(
            &pool,
            "u1",
            "github",
            None,
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[spec("profile", &[])],
            None,
            None,
        )
        .await
        .unwrap();

        let first = cancel_job(&pool, outcome.job.job.id).await.unwrap();
        assert!(first);
        let job = get_job(&pool, outcome.job.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let second = cancel_job(&pool, outcome.job.job.id).await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn create_completed_job_bundle_commits_job_cards_and_events_atomically() {
        let pool = test_pool().await;
        let cache = analyze_protocol::CacheInfo {
            hit: true,
            stale: false,
            as_of: Utc::now(),
            source: Some("analysis_cache".to_string()),
        };
        let outcome = create_completed_job_bundle(
            &pool,
            "u1",
            "github",
            Some("login:torvalds"),
            &serde_json::json!({"content": "torvalds"}),
            &serde_json::json!({}),
            &[CompletedCard {
                card_type: "profile".to_string(),
                output: analyze_protocol::CardOutput {
                    data: Some(serde_json::json!({"name": "Linus"})),
                    stream: Default::default(),
                },
                cache: cache.clone(),
            }],
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.job.job.status, JobStatus::Completed);
        assert_eq!(outcome.job.cards.len(), 1);
        assert_eq!(outcome.job.cards[0].status, CardStatus::Completed);
        assert_eq!(outcome.job.job.last_seq, 2);

        let events = crate::events::list_events_after(&pool, outcome.job.job.id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].event_type.is_job_terminal());
    }
}
