//! Event Store: append-only per-job event log with monotonic `seq` and
//! live tailing, built on `async-stream`'s `try_stream!` over a fixed
//! polling interval.

use std::time::Duration;

use analyze_protocol::{CardId, Event, EventType, JobId, JobStatus};
use async_stream::try_stream;
use chrono::Utc;
use futures::Stream;
use sqlx::{Row, SqlitePool};

use crate::error::{Result, StoreError};

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let payload_raw: String = row.try_get("payload")?;
    Ok(Event {
        job_id: JobId::new(row.try_get::<i64, _>("job_id")?),
        seq: row.try_get("seq")?,
        card_id: row.try_get::<Option<i64>, _>("card_id")?.map(CardId::new),
        event_type: serde_json::from_str(&payload_raw)?,
        created_at: row.try_get("created_at")?,
    })
}

/// Allocate the next `seq`, write the row, and bump `jobs.last_seq`, all
/// under one transaction — sqlite's single-writer lock is the "per-job
/// lock" the contract calls for.
pub async fn append_event(
    pool: &SqlitePool,
    job_id: JobId,
    card_id: Option<CardId>,
    event_type: EventType,
) -> Result<i64> {
    let mut tx = pool.begin().await.map_err(analyze_db::DbError::from)?;

    let next_seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE job_id = ?1")
        .bind(job_id.as_i64())
        .fetch_one(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?;

    let payload_raw = serde_json::to_string(&event_type)?;
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO events (job_id, seq, card_id, event_type, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(job_id.as_i64())
    .bind(next_seq)
    .bind(card_id.map(|c| c.as_i64()))
    .bind(event_type.kind())
    .bind(&payload_raw)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(analyze_db::DbError::from)?;

    sqlx::query("UPDATE jobs SET last_seq = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(next_seq)
        .bind(now)
        .bind(job_id.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(analyze_db::DbError::from)?;

    tx.commit().await.map_err(analyze_db::DbError::from)?;
    Ok(next_seq)
}

/// Authoritative last sequence number for a job. Callers may read
/// `job.last_seq` for a fast path but must fall back here if it reads 0.
pub async fn get_last_seq(pool: &SqlitePool, job_id: JobId) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM events WHERE job_id = ?1")
        .bind(job_id.as_i64())
        .fetch_one(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    Ok(seq)
}

pub async fn list_events_after(pool: &SqlitePool, job_id: JobId, after_seq: i64) -> Result<Vec<Event>> {
    let rows = sqlx::query("SELECT * FROM events WHERE job_id = ?1 AND seq > ?2 ORDER BY seq")
        .bind(job_id.as_i64())
        .bind(after_seq)
        .fetch_all(pool)
        .await
        .map_err(analyze_db::DbError::from)?;
    rows.iter().map(row_to_event).collect()
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lazily yield events with `seq > after_seq`, in order. When
/// `stop_when_done` is set, polls on a fixed interval and stops once a
/// job-terminal event has been yielded, or the job row is terminal with
/// no newer rows — ordering is strictly by `seq`, never wall time.
pub fn stream_events(
    pool: SqlitePool,
    job_id: JobId,
    after_seq: i64,
    stop_when_done: bool,
) -> impl Stream<Item = Result<Event>> {
    try_stream! {
        let mut cursor = after_seq;
        loop {
            let batch = list_events_after(&pool, job_id, cursor).await?;
            let mut saw_terminal = false;
            for event in batch {
                cursor = event.seq;
                saw_terminal = event.event_type.is_job_terminal();
                yield event;
            }
            if !stop_when_done {
                continue;
            }
            if saw_terminal {
                break;
            }
            let job = crate::jobs::get_job(&pool, job_id).await?;
            if job.status.is_terminal() && job.last_seq <= cursor {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyze_db::{create_pool, run_migrations, DbConfig};
    use futures::StreamExt;

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
    async fn append_event_allocates_dense_increasing_seq() {
        let (pool, job_id) = test_pool_with_job().await;
        let s1 = append_event(&pool, job_id, None, EventType::CardStarted { card: "profile".into() })
            .await
            .unwrap();
        let s2 = append_event(&pool, job_id, None, EventType::CardStarted { card: "repos".into() })
            .await
            .unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(get_last_seq(&pool, job_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stream_events_stops_after_job_terminal_event() {
        let (pool, job_id) = test_pool_with_job().await;
        append_event(&pool, job_id, None, EventType::CardStarted { card: "profile".into() })
            .await
            .unwrap();
        append_event(
            &pool,
            job_id,
            None,
            EventType::JobCompleted { status: JobStatus::Completed, cache: None },
        )
        .await
        .unwrap();

        let stream = stream_events(pool.clone(), job_id, 0, true);
        tokio::pin!(stream);
        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event.unwrap());
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.last().unwrap().event_type.is_job_terminal());
    }
}
