//! SQLite connection pool setup.
//!
//! A single concrete pool type (`sqlx::SqlitePool`) is used throughout the
//! workspace — the storage and cache crates write queries against SQLite
//! directly rather than against a database-agnostic trait, since nothing in
//! this engine needs to run against more than one backend.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::error::{DbError, Result};

pub type DbPool = SqlitePool;

/// Pool configuration. `url` accepts any `sqlx::sqlite` connection string,
/// including `sqlite::memory:` for tests.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Open a pool and apply the WAL/synchronous pragmas that matter for a
/// workload with many concurrent card writers and few readers.
pub async fn create_pool(config: DbConfig) -> Result<DbPool> {
    let is_memory = config.url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| DbError::InvalidState(format!("invalid database url: {e}")))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(if is_memory { 1 } else { config.max_connections })
        .connect_with(options)
        .await?;

    if !is_memory {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;
    }
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

    info!(url = %config.url, "connected to database");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_pool() {
        let pool = create_pool(DbConfig::in_memory()).await;
        assert!(pool.is_ok());
    }
}
