//! Job Store, Event Store and Artifact Store: the durable record of jobs,
//! cards, their append-only event log, and per-job intermediate payloads.

pub mod artifacts;
pub mod error;
pub mod events;
pub mod jobs;

pub use error::{Result, StoreError};
