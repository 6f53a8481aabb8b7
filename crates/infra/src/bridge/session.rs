//! Poll session state machine.
//!
//! One [`PollSession`] exists per caller request. It owns nothing but timing
//! data; the bridge feeds it the latest record read from the result store and
//! acts on the returned [`PollStep`].

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use taskbridge_core::{JobId, JobRecord, JobState};

/// Added to the final wait so it ends just past the deadline.
const DEADLINE_SLACK: Duration = Duration::from_millis(1);

/// What the bridge should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// Not finished yet; sleep for the given interval and poll again.
    Wait(Duration),
    /// The job succeeded with this value.
    Completed(Value),
    /// The job reached a failed (or revoked) state with this detail.
    Failed(String),
    /// The deadline passed before the job finished.
    TimedOut,
}

impl PollStep {
    pub fn is_final(&self) -> bool {
        !matches!(self, PollStep::Wait(_))
    }
}

#[derive(Debug, Clone)]
pub struct PollSession {
    job_id: JobId,
    started: Instant,
    check_interval: Duration,
    deadline: Duration,
    polls: u32,
}

impl PollSession {
    /// Start a session. `started` is the submission instant, so queueing
    /// time counts against the deadline.
    pub fn new(job_id: JobId, started: Instant, check_interval: Duration, deadline: Duration) -> Self {
        Self {
            job_id,
            started,
            check_interval,
            deadline,
            polls: 0,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() > self.deadline
    }

    /// The poll interval, cut short so the last wait does not overshoot the
    /// deadline.
    fn next_wait(&self) -> Duration {
        let remaining = self.deadline.saturating_sub(self.elapsed());
        self.check_interval.min(remaining + DEADLINE_SLACK)
    }

    /// Deadline check, done before each read of the result store.
    pub fn check_deadline(&self) -> Option<PollStep> {
        self.is_expired().then_some(PollStep::TimedOut)
    }

    /// Interpret the latest record read for this job.
    pub fn observe(&mut self, record: Option<&JobRecord>) -> PollStep {
        self.polls += 1;

        let Some(record) = record else {
            return PollStep::Wait(self.next_wait());
        };

        match record.state {
            JobState::Queued | JobState::Started => PollStep::Wait(self.next_wait()),
            JobState::Succeeded => PollStep::Completed(record.result.clone().unwrap_or(Value::Null)),
            JobState::Failed => PollStep::Failed(
                record
                    .error
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string()),
            ),
            JobState::Revoked => PollStep::Failed(match record.error.as_deref() {
                Some(reason) => format!("job revoked: {reason}"),
                None => "job revoked".to_string(),
            }),
        }
    }
}
