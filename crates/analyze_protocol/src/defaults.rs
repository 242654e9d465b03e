//! Canonical default values shared across the core and its CLI.

/// Default SQLite database URL when none is configured.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://analyze.db";

/// Default bind address for the HTTP control surface (`analyze serve`).
pub const DEFAULT_SERVE_ADDR: &str = "127.0.0.1:8088";

/// Card kind reserved for the implicit root of every plan.
pub const ROOT_CARD_KIND: &str = "_root";

/// Message stamped on a job cancelled by an explicit client request.
pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";

/// Current pipeline version baked into artifact keys when no override is set.
pub const DEFAULT_PIPELINE_VERSION: &str = "v1";
