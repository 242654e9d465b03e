//! Artifact Store: per-job intermediate payload by key, written once.

use analyze_protocol::JobId;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::{Result, StoreError};

pub async fn get_artifact(pool: &SqlitePool, job_id: JobId, key: &str) -> Result<Option<serde_json::Value>> {
    let row = sqlx::query("SELECT payload FROM artifacts WHERE job_id = ?1 AND key = ?2")
        .bind(job_id.as_i64())
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    match row {
        Some(row) => {
            let raw: String = row.try_get("payload")?;
            Ok(Some(serde_json::from_str(&raw)?))
        }
        None => Ok(None),
    }
}

/// Write-once per `(job_id, key)`; a second write is a logic error.
pub async fn put_artifact(pool: &SqlitePool, job_id: JobId, key: &str, payload: &serde_json::Value) -> Result<()> {
    let raw = serde_json::to_string(payload)?;
    let result = sqlx::query(
        "INSERT INTO artifacts (job_id, key, payload, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (job_id, key) DO NOTHING",
    )
    .bind(job_id.as_i64())
    .bind(key)
    .bind(&raw)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(analyze_db::DbError::from)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::ArtifactAlreadyWritten {
            job_id,
            key: key.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyze_db::{create_pool, run_migrations, DbConfig};

    async fn test_pool_with_job() -> (SqlitePool, JobId) {
        let pool = create_pool(DbConfig::in_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let job_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (user_id, source, input, options, status, last_seq, created_at, updated_at)
             VALUES ('u1', 'github', '{}', '{}', 'running', 0, ?1, ?1) RETURNING id",
        )
        .bind(Utc::now())
        .fetch_one(&pool)
        .await
        .unwrap();
        (pool, JobId::new(job_id))
    }

    #[tokio::test]
    async fn put_then_get_artifact_roundtrips() {
        let (pool, job_id) = test_pool_with_job().await;
        put_artifact(&pool, job_id, "resource.github.data", &serde_json::json!({"stars": 10}))
            .await
            .unwrap();
        let fetched = get_artifact(&pool, job_id, "resource.github.data").await.unwrap();
        assert_eq!(fetched, Some(serde_json::json!({"stars": 10})));
    }

    #[tokio::test]
    async fn second_write_to_same_key_is_rejected() {
        let (pool, job_id) = test_pool_with_job().await;
        put_artifact(&pool, job_id, "resource.github.data", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        let second = put_artifact(&pool, job_id, "resource.github.data", &serde_json::json!({"a": 2})).await;
        assert!(matches!(second, Err(StoreError::ArtifactAlreadyWritten { .. })));
    }
}
