//! `taskbridge-core`: domain building blocks for the dispatch-poll bridge.
//!
//! This crate contains **pure domain** primitives (no IO, no async runtime):
//! identifiers, the job lifecycle state machine, and the records stored in a
//! result store.

pub mod error;
pub mod id;
pub mod job;
pub mod record;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobState, NewJob};
pub use record::{JobRecord, WriteDecision};
