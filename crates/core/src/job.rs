//! Job model and lifecycle state machine.
//!
//! Transitions are monotonic:
//!
//! ```text
//! Queued -> Started -> { Succeeded | Failed | Revoked }
//! ```
//!
//! A job may also go straight from `Queued` to a terminal state (e.g. it was
//! revoked before a worker started it).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted by the queue, not yet claimed.
    Queued,
    /// Claimed by a worker and executing.
    Started,
    /// Finished with a value.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Revoked,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Revoked)
    }

    /// Position in the lifecycle. Terminal states share the highest rank.
    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Started => 1,
            JobState::Succeeded | JobState::Failed | JobState::Revoked => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    ///
    /// Re-asserting the same non-terminal state is allowed (at-least-once
    /// delivery may mark a job started twice). Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn check_transition(self, next: JobState) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Started => "started",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Revoked => "revoked",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job submission before the queue has assigned it an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Task name used to route the job to a handler.
    pub task: String,
    /// JSON parameters for the handler.
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(task: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task: task.into(),
            payload,
        }
    }
}

/// A job as carried by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, assigned at enqueue time.
    pub id: JobId,
    /// Task name for routing.
    pub task: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// When the queue accepted the job.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Materialize a submission with a fresh identifier.
    pub fn from_new(new: NewJob) -> Self {
        Self {
            id: JobId::new(),
            task: new.task,
            payload: new.payload,
            enqueued_at: Utc::now(),
        }
    }
}
