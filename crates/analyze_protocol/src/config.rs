//! Environment-driven configuration shared across the engine, ported from
//! `analyze/cache_policy.py` and `analyze/bg_refresh.py`.

use std::env;
use std::time::Duration;

fn read_int_env(name: &str, default: i64) -> i64 {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<i64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Per-source built-in TTL defaults (seconds), mirroring
/// `cache_policy.py::cache_ttl_seconds`'s `built_in_default` table.
fn builtin_ttl_default_secs(source_upper: &str) -> i64 {
    match source_upper {
        "SCHOLAR" => 3 * 24 * 3600,
        "LINKEDIN" => 7 * 24 * 3600,
        "GITHUB" => 6 * 3600,
        "TWITTER" => 24 * 3600,
        "OPENREVIEW" => 7 * 24 * 3600,
        "HUGGINGFACE" => 24 * 3600,
        "YOUTUBE" => 24 * 3600,
        _ => 24 * 3600,
    }
}

/// Per-source cache policy knobs: TTL, max-stale window, and the "every N
/// hits" background-refresh threshold.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl_secs: i64,
    pub max_stale_secs: i64,
    pub refresh_n_hits: i64,
}

impl CachePolicy {
    /// Resolve policy for `source`, consulting `ANALYZE_CACHE_*_<SOURCE>`
    /// before the global `ANALYZE_CACHE_*` default before the built-in
    /// table — the same fallback chain as `cache_policy.py`'s `_int_env`.
    pub fn for_source(source: &str) -> Self {
        let src = source.trim().to_ascii_uppercase();
        let ttl_secs = read_int_env(
            &format!("ANALYZE_CACHE_TTL_SECONDS_{src}"),
            read_int_env("ANALYZE_CACHE_TTL_SECONDS", builtin_ttl_default_secs(&src)),
        )
        .max(0);
        let max_stale_secs = read_int_env(
            &format!("ANALYZE_CACHE_MAX_STALE_SECONDS_{src}"),
            read_int_env("ANALYZE_CACHE_MAX_STALE_SECONDS", 7 * 24 * 3600),
        )
        .max(0);
        let refresh_n_hits = read_int_env(
            &format!("ANALYZE_CACHE_REFRESH_N_HITS_{src}"),
            read_int_env("ANALYZE_CACHE_REFRESH_N_HITS", 20),
        )
        .max(1);
        Self {
            ttl_secs,
            max_stale_secs,
            refresh_n_hits,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs as u64)
    }

    pub fn max_stale(&self) -> Duration {
        Duration::from_secs(self.max_stale_secs as u64)
    }
}

/// Per-card-kind retry budgets.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries_base: i32,
    pub max_retries_ai: i32,
    pub max_retries_resource: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_base: read_int_env("ANALYZE_MAX_RETRIES_BASE", 1) as i32,
            max_retries_ai: read_int_env("ANALYZE_MAX_RETRIES_AI", 2) as i32,
            max_retries_resource: read_int_env("ANALYZE_MAX_RETRIES_RESOURCE", 3) as i32,
        }
    }
}

/// Scheduler-wide knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub default_group_limit: usize,
    pub llm_group_limit: usize,
    pub resource_group_limit: usize,
    pub pipeline_version: String,
    pub cache_hit_direct_response: bool,
    pub stale_while_revalidate: bool,
    pub local_cache_enabled: bool,
    /// Full `sqlx::sqlite` connection string for the Local KV Cache's
    /// backing file. `None` lets the caller pick a default location
    /// (the engine falls back to a file under its log home).
    pub local_cache_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let max_workers = read_int_env("ANALYZE_SCHEDULER_MAX_WORKERS", 8).clamp(1, 32) as usize;
        Self {
            max_workers,
            default_group_limit: read_int_env("ANALYZE_GROUP_LIMIT_DEFAULT", 16).max(1) as usize,
            llm_group_limit: read_int_env("ANALYZE_GROUP_LIMIT_LLM", 2).max(1) as usize,
            resource_group_limit: read_int_env("ANALYZE_GROUP_LIMIT_RESOURCE", 4).max(1) as usize,
            pipeline_version: env::var("ANALYZE_PIPELINE_VERSION").unwrap_or_else(|_| "v1".to_string()),
            cache_hit_direct_response: read_bool_env("ANALYZE_CACHE_HIT_DIRECT_RESPONSE", true),
            stale_while_revalidate: read_bool_env("ANALYZE_STALE_WHILE_REVALIDATE", true),
            local_cache_enabled: read_bool_env("ANALYZE_LOCAL_CACHE_ENABLED", true),
            local_cache_path: env::var("ANALYZE_LOCAL_CACHE_PATH").ok(),
        }
    }
}

/// Background refresher pool knobs, ported from `bg_refresh.py`.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundRefreshConfig {
    pub enabled: bool,
    pub max_workers: usize,
    pub dedup_window: Duration,
}

impl Default for BackgroundRefreshConfig {
    fn default() -> Self {
        let max_workers = read_int_env("ANALYZE_BG_REFRESH_MAX_WORKERS", 2).clamp(1, 16) as usize;
        Self {
            enabled: read_bool_env("ANALYZE_BG_REFRESH_ENABLED", true),
            max_workers,
            dedup_window: Duration::from_secs(
                read_int_env("ANALYZE_BG_REFRESH_DEDUP_WINDOW_SECONDS", 300).max(0) as u64,
            ),
        }
    }
}

/// Top-level configuration bundle handed to the engine facade.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub background_refresh: BackgroundRefreshConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_url: env::var("ANALYZE_DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string()),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            background_refresh: BackgroundRefreshConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ttl_matches_known_sources() {
        assert_eq!(builtin_ttl_default_secs("GITHUB"), 6 * 3600);
        assert_eq!(builtin_ttl_default_secs("SCHOLAR"), 3 * 24 * 3600);
        assert_eq!(builtin_ttl_default_secs("UNKNOWN_SOURCE"), 24 * 3600);
    }

    #[test]
    fn scheduler_max_workers_clamped() {
        // Default (no env override) must land inside the documented [1, 32] clamp.
        let cfg = SchedulerConfig::default();
        assert!(cfg.max_workers >= 1 && cfg.max_workers <= 32);
    }
}
