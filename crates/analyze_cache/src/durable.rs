//! Analysis Cache: subject/pipeline/options-hashed durable cache of
//! final bundles and reusable intermediates, plus the refresh-run mutex.

use analyze_protocol::SubjectId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::Result;

pub struct CachedResult {
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub stale: bool,
}

pub async fn get_or_create_subject(
    pool: &SqlitePool,
    source: &str,
    subject_key: &str,
    canonical_input: &serde_json::Value,
) -> Result<SubjectId> {
    let canonical_raw = serde_json::to_string(canonical_input)?;
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO cache_subjects (source, subject_key, canonical_input) VALUES (?1, ?2, ?3)
         ON CONFLICT (source, subject_key) DO UPDATE SET canonical_input = excluded.canonical_input
         RETURNING id",
    )
    .bind(source)
    .bind(subject_key)
    .bind(&canonical_raw)
    .fetch_one(pool)
    .await
    .map_err(analyze_db::DbError::from)?;
    Ok(SubjectId::new(id))
}

/// A row is usable when it exists and `expires_at <= now` is either false
/// (fresh) or, if true, `now <= expires_at + max_stale`. Rows older than
/// that are treated as absent.
pub async fn get_cached_final_result(
    pool: &SqlitePool,
    source: &str,
    subject_key: &str,
    pipeline_version: &str,
    options_hash: &str,
    max_stale_secs: i64,
) -> Result<Option<CachedResult>> {
    let row = sqlx::query(
        "SELECT a.payload, a.created_at, a.expires_at
         FROM cache_artifacts a
         JOIN cache_subjects s ON s.id = a.subject_id
         WHERE s.source = ?1 AND s.subject_key = ?2 AND a.pipeline_version = ?3
           AND a.options_hash = ?4 AND a.kind = 'final_result'",
    )
    .bind(source)
    .bind(subject_key)
    .bind(pipeline_version)
    .bind(options_hash)
    .fetch_optional(pool)
    .await
    .map_err(analyze_db::DbError::from)?;

    let Some(row) = row else { return Ok(None) };
    let payload_raw: String = row.try_get("payload")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
    let now = Utc::now();

    if expires_at > now {
        return Ok(Some(CachedResult {
            payload: serde_json::from_str(&payload_raw)?,
            created_at,
            stale: false,
        }));
    }
    if now <= expires_at + ChronoDuration::seconds(max_stale_secs) {
        return Ok(Some(CachedResult {
            payload: serde_json::from_str(&payload_raw)?,
            created_at,
            stale: true,
        }));
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
async fn upsert_cache_artifact(
    pool: &SqlitePool,
    subject_id: SubjectId,
    pipeline_version: &str,
    options_hash: &str,
    kind: &str,
    payload: &serde_json::Value,
    fingerprint: Option<&str>,
    ttl_secs: i64,
    meta: &serde_json::Value,
) -> Result<()> {
    let payload_raw = serde_json::to_string(payload)?;
    let meta_raw = serde_json::to_string(meta)?;
    let now = Utc::now();
    let expires_at = now + ChronoDuration::seconds(ttl_secs.max(0));

    sqlx::query(
        "INSERT INTO cache_artifacts (subject_id, pipeline_version, options_hash, kind, payload, fingerprint, created_at, expires_at, meta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (subject_id, pipeline_version, options_hash, kind) DO UPDATE SET
             payload = excluded.payload,
             fingerprint = excluded.fingerprint,
             created_at = excluded.created_at,
             expires_at = excluded.expires_at,
             meta = excluded.meta",
    )
    .bind(subject_id.as_i64())
    .bind(pipeline_version)
    .bind(options_hash)
    .bind(kind)
    .bind(&payload_raw)
    .bind(fingerprint)
    .bind(now)
    .bind(expires_at)
    .bind(&meta_raw)
    .execute(pool)
    .await
    .map_err(analyze_db::DbError::from)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn save_full_report(
    pool: &SqlitePool,
    subject_id: SubjectId,
    pipeline_version: &str,
    options_hash: &str,
    fingerprint: Option<&str>,
    payload: &serde_json::Value,
    ttl_secs: i64,
    meta: &serde_json::Value,
) -> Result<()> {
    upsert_cache_artifact(
        pool,
        subject_id,
        pipeline_version,
        options_hash,
        "final_result",
        payload,
        fingerprint,
        ttl_secs,
        meta,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn save_cached_artifact(
    pool: &SqlitePool,
    subject_id: SubjectId,
    pipeline_version: &str,
    options_hash: &str,
    kind: &str,
    payload: &serde_json::Value,
    ttl_secs: i64,
    meta: &serde_json::Value,
) -> Result<()> {
    upsert_cache_artifact(
        pool,
        subject_id,
        pipeline_version,
        options_hash,
        kind,
        payload,
        None,
        ttl_secs,
        meta,
    )
    .await
}

/// CAS-style claim on `(subject, pipeline, options)`, keyed by the derived
/// artifact key. Only one caller wins while a run is `running`.
pub async fn try_begin_refresh_run(pool: &SqlitePool, artifact_key: &str) -> Result<bool> {
    let now = Utc::now();
    let row: Option<String> = sqlx::query_scalar(
        "INSERT INTO refresh_runs (artifact_key, state, claimed_at, finished_at)
         VALUES (?1, 'running', ?2, NULL)
         ON CONFLICT (artifact_key) DO UPDATE SET state = 'running', claimed_at = excluded.claimed_at, finished_at = NULL
         WHERE refresh_runs.state != 'running'
         RETURNING artifact_key",
    )
    .bind(artifact_key)
    .bind(now)
    .fetch_optional(pool)
    .await
    .map_err(analyze_db::DbError::from)?;
    Ok(row.is_some())
}

pub async fn fail_refresh_run(pool: &SqlitePool, artifact_key: &str) -> Result<()> {
    sqlx::query("UPDATE refresh_runs SET state = 'failed', finished_at = ?1 WHERE artifact_key = ?2")
        .bind(Utc::now())
        .bind(artifact_key)
        .execute(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    Ok(())
}

pub async fn complete_refresh_run(pool: &SqlitePool, artifact_key: &str) -> Result<()> {
    sqlx::query("UPDATE refresh_runs SET state = 'done', finished_at = ?1 WHERE artifact_key = ?2")
        .bind(Utc::now())
        .bind(artifact_key)
        .execute(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    Ok(())
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

    #[tokio::test]
    async fn fresh_final_result_round_trips() {
        let pool = test_pool().await;
        let subject_id = get_or_create_subject(&pool, "github", "login:torvalds", &serde_json::json!({}))
            .await
            .unwrap();
        save_full_report(
            &pool,
            subject_id,
            "v1",
            "opts1",
            None,
            &serde_json::json!({"cards": {}}),
            3600,
            &serde_json::json!({}),
        )
        .await
        .unwrap();

        let hit = get_cached_final_result(&pool, "github", "login:torvalds", "v1", "opts1", 0)
            .await
            .unwrap()
            .unwrap();
        assert!(!hit.stale);
    }

    #[tokio::test]
    async fn expired_result_outside_max_stale_is_absent() {
        let pool = test_pool().await;
        let subject_id = get_or_create_subject(&pool, "github", "login:torvalds", &serde_json::json!({}))
            .await
            .unwrap();
        save_full_report(
            &pool,
            subject_id,
            "v1",
            "opts1",
            None,
            &serde_json::json!({}),
            -10,
            &serde_json::json!({}),
        )
        .await
        .unwrap();

        let miss = get_cached_final_result(&pool, "github", "login:torvalds", "v1", "opts1", 0)
            .await
            .unwrap();
        assert!(miss.is_none());

        let stale_hit = get_cached_final_result(&pool, "github", "login:torvalds", "v1", "opts1", 3600)
            .await
            .unwrap()
            .unwrap();
        assert!(stale_hit.stale);
    }

    #[tokio::test]
    async fn refresh_run_is_single_winner() {
        let pool = test_pool().await;
        let first = try_begin_refresh_run(&pool, "key-1").await.unwrap();
        let second = try_begin_refresh_run(&pool, "key-1").await.unwrap();
        assert!(first);
        assert!(!second);

        complete_refresh_run(&pool, "key-1").await.unwrap();
        let third = try_begin_refresh_run(&pool, "key-1").await.unwrap();
        assert!(third);
    }
}
