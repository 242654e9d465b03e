//! Planner: expands `(source, requested_cards)` into an ordered card
//! DAG with dependencies, priority and concurrency group.

pub mod builder;
pub mod matrix;

pub use builder::{build_plan, normalize_cards};
pub use matrix::{default_matrix, CardDef, CardMatrix};
