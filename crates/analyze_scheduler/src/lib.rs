//! Card scheduler, executor/quality-gate interfaces, cache-hit fast path
//! and background refresher — the orchestration layer sitting on top of
//! the Job/Event/Artifact Store and the two cache tiers.

pub mod error;
pub mod executor;
pub mod fast_path;
pub mod quality_gate;
pub mod refresher;
pub mod scheduler;

pub use error::{ExecutorError, Result, SchedulerError};
pub use executor::{CardContext, CardExecutor, ProgressMessage, ProgressSink};
pub use fast_path::{try_fast_path, FastPathOutcome};
pub use quality_gate::{GateAction, GateVerdict, NoopGate, QualityGate, QualityGateContext};
pub use refresher::BackgroundRefresher;
pub use scheduler::Scheduler;
