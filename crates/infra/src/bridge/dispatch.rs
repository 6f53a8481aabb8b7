//! Submit a job, poll for its result, revoke it on timeout.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{Span, debug, error, info, instrument, warn};

use taskbridge_core::{JobId, NewJob};
use taskbridge_queue::{JobQueue, QueueError, ResultStore, ResultStoreError};

use super::session::{PollSession, PollStep};
use crate::config::BridgeConfig;

/// Message returned to callers whose job outlived the deadline.
pub const PENDING_MESSAGE: &str = "We cannot process your request yet, please try again later";

/// Outcome of one `submit_and_wait` call that did not error.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    Completed {
        job_id: JobId,
        value: Value,
        elapsed: Duration,
    },
    /// The deadline passed. The job was revoked and may still finish; the
    /// caller should treat this as "try again later", not as a failure.
    Pending {
        job_id: JobId,
        message: String,
        elapsed: Duration,
    },
    Failed {
        job_id: JobId,
        error: String,
        elapsed: Duration,
    },
}

impl BridgeOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            BridgeOutcome::Completed { job_id, .. }
            | BridgeOutcome::Pending { job_id, .. }
            | BridgeOutcome::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            BridgeOutcome::Completed { elapsed, .. }
            | BridgeOutcome::Pending { elapsed, .. }
            | BridgeOutcome::Failed { elapsed, .. } => *elapsed,
        }
    }
}

/// Bridge error.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The queue could not be reached at submit time. Nothing was enqueued.
    #[error("broker unavailable")]
    BrokerUnavailable(#[source] QueueError),
    /// The queue refused the job for another reason.
    #[error("failed to submit job")]
    Submit(#[source] QueueError),
    #[error("failed to encode job parameters")]
    Encode(#[source] serde_json::Error),
    /// Reading the result store failed while waiting.
    #[error("failed to poll result of job {job_id}")]
    Poll {
        job_id: JobId,
        #[source]
        source: ResultStoreError,
    },
}

impl BridgeError {
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(self, BridgeError::BrokerUnavailable(_))
    }

    /// Job id, if the job was enqueued before the error.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            BridgeError::Poll { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

impl From<QueueError> for BridgeError {
    fn from(e: QueueError) -> Self {
        if e.is_unavailable() {
            BridgeError::BrokerUnavailable(e)
        } else {
            BridgeError::Submit(e)
        }
    }
}

/// Bridges a synchronous caller to the asynchronous worker fleet.
///
/// Each call gets its own [`PollSession`]; concurrent calls share only the
/// queue and result store handles.
#[derive(Debug, Clone)]
pub struct DispatchBridge<Q, R> {
    queue: Q,
    results: R,
    config: BridgeConfig,
}

impl<Q, R> DispatchBridge<Q, R>
where
    Q: JobQueue,
    R: ResultStore,
{
    pub fn new(queue: Q, results: R, config: BridgeConfig) -> Self {
        Self {
            queue,
            results,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Submit `task` and wait up to the configured task timeout.
    pub async fn submit_and_wait<P>(&self, task: &str, params: &P) -> Result<BridgeOutcome, BridgeError>
    where
        P: Serialize + ?Sized,
    {
        self.submit_and_wait_with_deadline(task, params, self.config.task_timeout)
            .await
    }

    #[instrument(
        name = "bridge.submit_and_wait",
        skip(self, params),
        fields(job_id = tracing::field::Empty, deadline_ms = deadline.as_millis() as u64)
    )]
    pub async fn submit_and_wait_with_deadline<P>(
        &self,
        task: &str,
        params: &P,
        deadline: Duration,
    ) -> Result<BridgeOutcome, BridgeError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(params).map_err(BridgeError::Encode)?;
        let submitted = Instant::now();

        let job_id = self.queue.enqueue(NewJob::new(task, payload)).await.map_err(|e| {
            error!(task, error = %e, "failed to submit job");
            BridgeError::from(e)
        })?;

        Span::current().record("job_id", tracing::field::display(job_id));
        info!(job_id = %job_id, task, "job submitted");

        let session = PollSession::new(job_id, submitted, self.config.check_interval, deadline);
        self.wait(session).await
    }

    async fn wait(&self, mut session: PollSession) -> Result<BridgeOutcome, BridgeError> {
        let job_id = session.job_id();

        loop {
            let step = match session.check_deadline() {
                Some(timed_out) => timed_out,
                None => {
                    let record = self.results.get(job_id).await.map_err(|source| {
                        error!(
                            job_id = %job_id,
                            polls = session.polls(),
                            elapsed_ms = session.elapsed().as_millis() as u64,
                            error = %source,
                            "failed to read job result"
                        );
                        BridgeError::Poll { job_id, source }
                    })?;
                    session.observe(record.as_ref())
                }
            };

            let elapsed = session.elapsed();
            match step {
                PollStep::Wait(interval) => {
                    debug!(job_id = %job_id, polls = session.polls(), "job not finished yet");
                    tokio::time::sleep(interval).await;
                }
                PollStep::Completed(value) => {
                    info!(job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                    return Ok(BridgeOutcome::Completed {
                        job_id,
                        value,
                        elapsed,
                    });
                }
                PollStep::Failed(error) => {
                    warn!(job_id = %job_id, error = %error, "job failed");
                    return Ok(BridgeOutcome::Failed {
                        job_id,
                        error,
                        elapsed,
                    });
                }
                PollStep::TimedOut => {
                    warn!(
                        job_id = %job_id,
                        deadline_ms = session.deadline().as_millis() as u64,
                        polls = session.polls(),
                        "job timed out, revoking"
                    );
                    self.revoke(job_id).await;
                    return Ok(BridgeOutcome::Pending {
                        job_id,
                        message: PENDING_MESSAGE.to_string(),
                        elapsed,
                    });
                }
            }
        }
    }

    /// Fire-and-forget cancellation. Failures are logged, never returned.
    async fn revoke(&self, job_id: JobId) {
        if let Err(e) = self.queue.revoke(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to deliver revocation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;
    use taskbridge_core::{JobRecord, WorkerId};
    use taskbridge_queue::{InMemoryJobQueue, InMemoryResultStore};

    type TestBridge = DispatchBridge<Arc<InMemoryJobQueue>, Arc<InMemoryResultStore>>;

    fn bridge() -> (TestBridge, Arc<InMemoryJobQueue>, Arc<InMemoryResultStore>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let results = Arc::new(InMemoryResultStore::new());
        let bridge = DispatchBridge::new(Arc::clone(&queue), Arc::clone(&results), BridgeConfig::default());
        (bridge, queue, results)
    }

    /// Claims the next job and writes `record_for(job_id)` after `after`.
    fn fake_worker(
        queue: Arc<InMemoryJobQueue>,
        results: Arc<InMemoryResultStore>,
        after: Duration,
        record_for: impl FnOnce(JobId) -> JobRecord + Send + 'static,
    ) {
        tokio::spawn(async move {
            let delivery = queue.claim("fake").await.unwrap();
            tokio::time::sleep(after).await;
            results.write(record_for(delivery.job_id())).await.unwrap();
            queue.ack(&delivery).await.unwrap();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn completed_job_returns_value_and_elapsed() {
        let (bridge, queue, results) = bridge();
        fake_worker(queue, results, Duration::from_secs(3), |id| {
            JobRecord::succeeded(id, WorkerId::new(), Utc::now(), json!("done"))
        });

        let outcome = bridge.submit_and_wait("process", &json!({"delay": 3})).await.unwrap();

        let BridgeOutcome::Completed { value, elapsed, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(value, json!("done"));
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_carries_error_and_id() {
        let (bridge, queue, results) = bridge();
        fake_worker(queue, results, Duration::ZERO, |id| {
            JobRecord::failed(id, WorkerId::new(), None, "division by zero")
        });

        let outcome = bridge.submit_and_wait("process", &json!({})).await.unwrap();

        match outcome {
            BridgeOutcome::Failed { error, job_id, .. } => {
                assert_eq!(error, "division by zero");
                assert_ne!(job_id.to_string(), "");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_revokes_exactly_once_and_is_pending() {
        let (bridge, queue, _results) = bridge();

        let outcome = bridge.submit_and_wait("process", &json!({"delay": 35})).await.unwrap();

        let BridgeOutcome::Pending { job_id, elapsed, message } = outcome else {
            panic!("expected pending, got {outcome:?}");
        };
        assert!(elapsed > Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
        assert_eq!(message, PENDING_MESSAGE);
        assert_eq!(queue.revoke_calls(job_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_override_applies() {
        let (bridge, queue, _results) = bridge();

        let outcome = bridge
            .submit_and_wait_with_deadline("process", &json!({}), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(matches!(outcome, BridgeOutcome::Pending { .. }));
        assert!(outcome.elapsed() < Duration::from_secs(3));
        assert_eq!(queue.revoke_calls(outcome.job_id()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_is_returned_at_the_deadline_not_the_next_poll() {
        let (bridge, _queue, _results) = bridge();

        let outcome = bridge
            .submit_and_wait_with_deadline("process", &json!({}), Duration::from_millis(1200))
            .await
            .unwrap();

        assert!(matches!(outcome, BridgeOutcome::Pending { .. }));
        assert!(outcome.elapsed() > Duration::from_millis(1200));
        assert!(outcome.elapsed() <= Duration::from_millis(1205));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revoke_still_returns_pending() {
        let (bridge, queue, _results) = bridge();
        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            q.set_available(false);
        });

        let outcome = bridge
            .submit_and_wait_with_deadline("process", &json!({}), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(matches!(outcome, BridgeOutcome::Pending { .. }));
    }

    #[tokio::test]
    async fn broker_down_fails_fast_without_job_id() {
        let (bridge, queue, _results) = bridge();
        queue.set_available(false);

        let err = bridge.submit_and_wait("process", &json!({})).await.unwrap_err();

        assert!(err.is_broker_unavailable());
        assert_eq!(err.job_id(), None);
        queue.set_available(true);
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn result_store_error_is_surfaced_with_source() {
        let (bridge, _queue, results) = bridge();
        results.set_available(false);

        let err = bridge.submit_and_wait("process", &json!({})).await.unwrap_err();

        let BridgeError::Poll { job_id, source } = &err else {
            panic!("expected poll error, got {err:?}");
        };
        assert!(matches!(source, ResultStoreError::Unavailable(_)));
        assert_eq!(err.job_id(), Some(*job_id));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sessions_are_independent() {
        let (bridge, queue, results) = bridge();
        let bridge = Arc::new(bridge);

        fake_worker(Arc::clone(&queue), Arc::clone(&results), Duration::from_secs(1), |id| {
            JobRecord::succeeded(id, WorkerId::new(), Utc::now(), json!("first"))
        });

        let a = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.submit_and_wait("process", &json!({})).await })
        };
        let b = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .submit_and_wait_with_deadline("process", &json!({}), Duration::from_secs(5))
                    .await
            })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        let outcomes = [a, b];
        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, BridgeOutcome::Completed { .. }))
            .count();
        let pending = outcomes
            .iter()
            .filter(|o| matches!(o, BridgeOutcome::Pending { .. }))
            .count();
        assert_eq!(completed, 1);
        assert_eq!(pending, 1);
    }
}
