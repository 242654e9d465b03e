//! SQLite pool, schema migrations and leaf error type shared by the
//! storage and cache crates.

pub mod error;
pub mod pool;

pub use error::{DbError, Result};
pub use pool::{create_pool, DbConfig, DbPool};

/// Embedded schema migrations (jobs, cards, events, cache tables).
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
