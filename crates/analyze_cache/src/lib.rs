//! Analysis Cache (durable) and Local KV Cache (bounded, SQLite-file-
//! backed TTL map) for reusing prior analysis runs across requests.

pub mod cacheability;
pub mod durable;
pub mod error;
pub mod local;

pub use cacheability::is_cacheable_subject;
pub use error::{CacheError, Result};
pub use local::LocalKvCache;
