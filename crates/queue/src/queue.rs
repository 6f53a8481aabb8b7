//! Job queue abstraction.
//!
//! The queue is the **transport** between submitters and workers. It makes a
//! small number of promises:
//!
//! - **Synchronous ids**: `enqueue` returns the job's identifier before any
//!   execution has necessarily started.
//! - **At-least-once**: a claimed job stays owned by the queue until it is
//!   acknowledged. If the claimant disappears, the job is delivered again.
//! - **Exclusive claims**: while a consumer keeps extending a delivery, no
//!   other consumer receives the same job.
//! - **Late acknowledgment**: workers call [`JobQueue::ack`] only after the
//!   terminal result has been written, so duplicates are possible and handlers
//!   should be safe to re-run.
//! - **Advisory revocation**: [`JobQueue::revoke`] is a one-way signal. It does
//!   not wait for, or guarantee, the job actually stopping.
//!
//! ## Error Handling
//!
//! `enqueue` must fail loudly with [`QueueError::Unavailable`] when the
//! transport cannot be reached; it never drops a job silently.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskbridge_core::{Job, JobId, NewJob};

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The broker/transport could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// A job could not be encoded or decoded for transport.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The delivery is no longer owned by this consumer (already acked,
    /// rejected, or redelivered elsewhere).
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),
    #[error("queue internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Opaque handle identifying one claim of a job.
///
/// A redelivered job gets a new receipt; acknowledging a stale receipt fails
/// with [`QueueError::UnknownDelivery`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryReceipt(String);

impl DeliveryReceipt {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryReceipt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job handed to a worker, together with its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    job: Job,
    receipt: DeliveryReceipt,
    delivery_count: u32,
}

impl Delivery {
    pub fn new(job: Job, receipt: DeliveryReceipt, delivery_count: u32) -> Self {
        Self {
            job,
            receipt,
            delivery_count,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn receipt(&self) -> &DeliveryReceipt {
        &self.receipt
    }

    /// How many times this job has been handed out, including this delivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Durable, at-least-once job transport.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Accept a job and return its identifier.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Wait for the next job for `consumer`.
    async fn claim(&self, consumer: &str) -> Result<Delivery, QueueError>;

    /// Keep a delivery owned by its consumer. Long-running jobs call this
    /// more often than the visibility timeout so a live worker is never
    /// mistaken for a lost one. Fails with [`QueueError::UnknownDelivery`]
    /// once the delivery has been settled or handed to another consumer.
    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledge a delivery; the job will not be delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Give a delivery back. With `requeue` the job becomes claimable again,
    /// otherwise it is dropped.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Fire-and-forget cancellation signal.
    async fn revoke(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Whether a revocation has been recorded for `job_id`.
    async fn is_revoked(&self, job_id: JobId) -> Result<bool, QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        (**self).enqueue(job).await
    }

    async fn claim(&self, consumer: &str) -> Result<Delivery, QueueError> {
        (**self).claim(consumer).await
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).extend(delivery).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        (**self).reject(delivery, requeue).await
    }

    async fn revoke(&self, job_id: JobId) -> Result<(), QueueError> {
        (**self).revoke(job_id).await
    }

    async fn is_revoked(&self, job_id: JobId) -> Result<bool, QueueError> {
        (**self).is_revoked(job_id).await
    }
}
