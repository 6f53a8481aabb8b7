//! Result store abstraction.
//!
//! Keyed by [`JobId`], written by workers, polled by the bridge. Implementations
//! must make each write atomic per key and must route every write through
//! [`JobRecord::decide`], so that a record never moves backwards and the first
//! terminal write wins.

use std::sync::Arc;

use async_trait::async_trait;

use taskbridge_core::{JobId, JobRecord, WriteDecision};

/// Result store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultStoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("result store internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store `record` unless it would regress the stored state.
    async fn write(&self, record: JobRecord) -> Result<WriteDecision, ResultStoreError>;

    /// Read the current record, `None` if nothing has been written yet.
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, ResultStoreError>;
}

#[async_trait]
impl<R> ResultStore for Arc<R>
where
    R: ResultStore + ?Sized,
{
    async fn write(&self, record: JobRecord) -> Result<WriteDecision, ResultStoreError> {
        (**self).write(record).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, ResultStoreError> {
        (**self).get(job_id).await
    }
}
