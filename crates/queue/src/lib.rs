//! Queue and result-store contracts (mechanics only).
//!
//! The bridge and the workers only ever talk to a [`JobQueue`] and a
//! [`ResultStore`]. Broker-backed implementations live in `taskbridge-infra`;
//! this crate ships the contracts plus in-memory implementations for tests,
//! development, and single-process deployments.

pub mod in_memory_queue;
pub mod in_memory_results;
pub mod queue;
pub mod results;

pub use in_memory_queue::{DeadLetter, InMemoryJobQueue};
pub use in_memory_results::InMemoryResultStore;
pub use queue::{Delivery, DeliveryReceipt, JobQueue, QueueError};
pub use results::{ResultStore, ResultStoreError};
