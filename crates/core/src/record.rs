//! Result-store records.
//!
//! A [`JobRecord`] is what a worker writes and what the bridge polls. Writes go
//! through [`JobRecord::decide`] so every store implementation applies the same
//! monotonic rules: records only move forward, and the first terminal write wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, WorkerId};
use crate::job::JobState;

/// Stored state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub state: JobState,
    /// Value returned by the handler (`Succeeded` only).
    pub result: Option<serde_json::Value>,
    /// Error description (`Failed` and `Revoked`).
    pub error: Option<String>,
    /// Worker slot that produced this record, if any.
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of checking an incoming write against the stored record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteDecision {
    /// The write moves the record forward and must be stored.
    Apply,
    /// The write would regress or overwrite a terminal record; drop it.
    Ignore,
}

impl JobRecord {
    fn base(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            result: None,
            error: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn queued(job_id: JobId) -> Self {
        Self::base(job_id, JobState::Queued)
    }

    pub fn started(job_id: JobId, worker_id: WorkerId) -> Self {
        Self {
            worker_id: Some(worker_id),
            started_at: Some(Utc::now()),
            ..Self::base(job_id, JobState::Started)
        }
    }

    pub fn succeeded(
        job_id: JobId,
        worker_id: WorkerId,
        started_at: DateTime<Utc>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            result: Some(value),
            worker_id: Some(worker_id),
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
            ..Self::base(job_id, JobState::Succeeded)
        }
    }

    pub fn failed(
        job_id: JobId,
        worker_id: WorkerId,
        started_at: Option<DateTime<Utc>>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            worker_id: Some(worker_id),
            started_at,
            completed_at: Some(Utc::now()),
            ..Self::base(job_id, JobState::Failed)
        }
    }

    pub fn revoked(
        job_id: JobId,
        worker_id: Option<WorkerId>,
        started_at: Option<DateTime<Utc>>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(reason.into()),
            worker_id,
            started_at,
            completed_at: Some(Utc::now()),
            ..Self::base(job_id, JobState::Revoked)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Decide whether `incoming` may replace `existing`.
    pub fn decide(existing: Option<&JobRecord>, incoming: &JobRecord) -> WriteDecision {
        match existing {
            None => WriteDecision::Apply,
            Some(current) if current.state.can_transition_to(incoming.state) => {
                WriteDecision::Apply
            }
            Some(_) => WriteDecision::Ignore,
        }
    }

    /// Carry forward fields the incoming write does not know about (e.g. a
    /// terminal write from a path that never saw the `Started` timestamp).
    pub fn merged_with(mut self, existing: Option<&JobRecord>) -> Self {
        if let Some(prev) = existing {
            if self.started_at.is_none() {
                self.started_at = prev.started_at;
            }
            if self.worker_id.is_none() {
                self.worker_id = prev.worker_id;
            }
        }
        self
    }
}
