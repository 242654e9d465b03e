//! Local KV Cache: a bounded, SQLite-file-backed TTL map of compressed
//! JSON blobs. Safe for concurrent OS processes on one machine the same
//! way the rest of the crate's SQLite usage is — WAL mode, short
//! transactions, `ON CONFLICT` upserts — rather than a pure in-process
//! map, since two engine processes on a box must not each believe they
//! own the only copy of a hot cache entry. Ported from
//! `utils/sqlite_cache.py`'s `SqliteCache`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use analyze_db::{create_pool, DbConfig};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{CacheError, Result};

fn now_s() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Bounded, file-backed cache. Cheap to `Clone` (an `Arc`-backed pool
/// handle); multiple OS processes pointed at the same file see each
/// other's writes through SQLite's own locking.
#[derive(Clone)]
pub struct LocalKvCache {
    pool: SqlitePool,
    max_bytes: Arc<AtomicI64>,
}

impl LocalKvCache {
    /// Open (creating if missing) the cache file at `url` — any
    /// `sqlx::sqlite` connection string, including `sqlite::memory:` for
    /// tests (a single connection, not shared across processes).
    pub async fn open(url: &str, max_bytes: i64) -> Result<Self> {
        let pool = create_pool(DbConfig::new(url)).await.map_err(CacheError::Db)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                created_at_s INTEGER NOT NULL,
                expires_at_s INTEGER,
                hit_count INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .map_err(analyze_db::DbError::from)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS kv_expires_at_idx ON kv(expires_at_s)")
            .execute(&pool)
            .await
            .map_err(analyze_db::DbError::from)?;

        Ok(Self {
            pool,
            max_bytes: Arc::new(AtomicI64::new(max_bytes.max(0))),
        })
    }

    pub async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value, expires_at_s FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(analyze_db::DbError::from)?;
        let Some(row) = row else { return Ok(None) };

        let expires_at_s: Option<i64> = row.try_get("expires_at_s")?;
        if let Some(expires_at_s) = expires_at_s {
            if expires_at_s <= now_s() {
                self.remove(key).await?;
                return Ok(None);
            }
        }

        let compressed: Vec<u8> = row.try_get("value")?;
        let raw = zstd::stream::decode_all(compressed.as_slice())
            .map_err(|e| CacheError::Compression(e.to_string()))?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub async fn set_json(&self, key: &str, value: &serde_json::Value, expires_at_s: Option<i64>) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        let compressed = zstd::stream::encode_all(raw.as_slice(), 3)
            .map_err(|e| CacheError::Compression(e.to_string()))?;

        sqlx::query(
            "INSERT INTO kv (key, value, created_at_s, expires_at_s, hit_count) VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT (key) DO UPDATE SET
                 value = excluded.value,
                 created_at_s = excluded.created_at_s,
                 expires_at_s = excluded.expires_at_s,
                 hit_count = 0",
        )
        .bind(key)
        .bind(&compressed)
        .bind(now_s())
        .bind(expires_at_s)
        .execute(&self.pool)
        .await
        .map_err(analyze_db::DbError::from)?;

        self.enforce_byte_cap().await
    }

    /// Increment and return the hit counter for `key`, reset to zero each
    /// time the row is (re)written by `set_json`. Backs the per-source
    /// "every N hits" background-refresh trigger. Returns `0` for a key
    /// with no row (nothing to count).
    pub async fn record_hit(&self, key: &str) -> Result<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("UPDATE kv SET hit_count = hit_count + 1 WHERE key = ?1 RETURNING hit_count")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(analyze_db::DbError::from)?;
        Ok(count.unwrap_or(0))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(analyze_db::DbError::from)?;
        Ok(())
    }

    async fn current_bytes(&self) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar("SELECT SUM(LENGTH(value)) FROM kv")
            .fetch_one(&self.pool)
            .await
            .map_err(analyze_db::DbError::from)?;
        Ok(total.unwrap_or(0))
    }

    /// Evict oldest-created rows first until under the soft byte cap.
    async fn enforce_byte_cap(&self) -> Result<()> {
        let cap = self.max_bytes.load(Ordering::Relaxed);
        if cap <= 0 {
            return Ok(());
        }
        while self.current_bytes().await? > cap {
            let oldest: Option<String> =
                sqlx::query_scalar("SELECT key FROM kv ORDER BY created_at_s ASC, rowid ASC LIMIT 1")
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(analyze_db::DbError::from)?;
            match oldest {
                Some(key) => self.remove(&key).await?,
                None => break,
            }
        }
        Ok(())
    }

    /// Sweep all expired rows. Intended to run on a periodic tick.
    pub async fn sweep_expired(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE expires_at_s IS NOT NULL AND expires_at_s <= ?1")
            .bind(now_s())
            .execute(&self.pool)
            .await
            .map_err(analyze_db::DbError::from)?;
        Ok(())
    }

    pub async fn len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv")
            .fetch_one(&self.pool)
            .await
            .map_err(analyze_db::DbError::from)?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Spawn the background eviction task; drop the returned handle to
    /// detach, or abort it on shutdown.
    pub fn spawn_eviction_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match cache.sweep_expired().await {
                    Ok(()) => debug!("local cache eviction sweep"),
                    Err(e) => debug!(error = %e, "local cache eviction sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_cache(max_bytes: i64) -> LocalKvCache {
        LocalKvCache::open("sqlite::memory:", max_bytes).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = test_cache(1 << 20).await;
        cache.set_json("k1", &serde_json::json!({"a": 1}), None).await.unwrap();
        assert_eq!(cache.get_json("k1").await.unwrap(), Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = test_cache(1 << 20).await;
        cache.set_json("k1", &serde_json::json!(1), Some(now_s() - 1)).await.unwrap();
        assert_eq!(cache.get_json("k1").await.unwrap(), None);
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn byte_cap_evicts_oldest_first() {
        let cache = test_cache(1).await;
        cache
            .set_json("old", &serde_json::json!({"payload": "x".repeat(100)}), None)
            .await
            .unwrap();
        cache
            .set_json("new", &serde_json::json!({"payload": "y".repeat(100)}), None)
            .await
            .unwrap();
        assert!(cache.get_json("old").await.unwrap().is_none());
        assert!(cache.get_json("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn record_hit_increments_and_resets_on_rewrite() {
        let cache = test_cache(1 << 20).await;
        cache.set_json("k1", &serde_json::json!(1), None).await.unwrap();
        assert_eq!(cache.record_hit("k1").await.unwrap(), 1);
        assert_eq!(cache.record_hit("k1").await.unwrap(), 2);
        cache.set_json("k1", &serde_json::json!(2), None).await.unwrap();
        assert_eq!(cache.record_hit("k1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_hit_on_missing_key_is_zero() {
        let cache = test_cache(1 << 20).await;
        assert_eq!(cache.record_hit("missing").await.unwrap(), 0);
    }
}
