//! Single-slot job execution.
//!
//! A [`Worker`] takes one [`Delivery`], runs it to a terminal [`JobRecord`]
//! and settles the delivery with the queue. Failures never escape as errors:
//! handler errors, panics and missing handlers all become `Failed` records.
//!
//! Order of operations for one delivery:
//!
//! 1. skip execution if the job was revoked before it started
//! 2. write `Started`
//! 3. run the handler on its own task, extending the delivery and watching
//!    for revocation, the soft time limit and loss of the broker connection
//! 4. write the terminal record
//! 5. acknowledge (late ack), or reject with requeue if the write failed

use std::any::Any;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskbridge_core::{JobId, JobRecord, JobState, WorkerId, WriteDecision};
use taskbridge_queue::{Delivery, JobQueue, QueueError, ResultStore};

use super::handler::{CancelReason, HandlerError, HandlerRegistry, JobContext, JobHandler};
use crate::config::WorkerConfig;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// A terminal record was written (or an earlier one was kept).
    Finished {
        record: JobRecord,
        decision: WriteDecision,
    },
    /// No terminal record was written; the job is left for redelivery.
    Abandoned { job_id: JobId, reason: String },
}

impl Execution {
    pub fn job_id(&self) -> JobId {
        match self {
            Execution::Finished { record, .. } => record.job_id,
            Execution::Abandoned { job_id, .. } => *job_id,
        }
    }

    /// Terminal state written by this execution, if any.
    pub fn state(&self) -> Option<JobState> {
        match self {
            Execution::Finished { record, .. } => Some(record.state),
            Execution::Abandoned { .. } => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Execution::Finished {
                decision: WriteDecision::Ignore,
                ..
            }
        )
    }
}

enum Failure {
    Handler(HandlerError),
    Panicked(String),
    Aborted(String),
}

/// One worker slot.
pub struct Worker<Q, R> {
    id: WorkerId,
    consumer: String,
    queue: Q,
    results: R,
    registry: HandlerRegistry,
    config: WorkerConfig,
    executed: u32,
}

impl<Q, R> Worker<Q, R>
where
    Q: JobQueue,
    R: ResultStore,
{
    pub fn new(
        consumer: impl Into<String>,
        queue: Q,
        results: R,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: WorkerId::new(),
            consumer: consumer.into(),
            queue,
            results,
            registry,
            config,
            executed: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Deliveries handled so far.
    pub fn executed(&self) -> u32 {
        self.executed
    }

    /// Whether this slot has reached `max_jobs_per_worker` and should retire.
    pub fn is_exhausted(&self) -> bool {
        self.config
            .max_jobs_per_worker
            .is_some_and(|max| self.executed >= max)
    }

    /// Wait for the next delivery for this slot.
    pub async fn claim(&self) -> Result<Delivery, QueueError> {
        self.queue.claim(&self.consumer).await
    }

    /// Run one delivery to completion and settle it with the queue.
    pub async fn execute(&mut self, delivery: &Delivery) -> Execution {
        let job = delivery.job();
        let job_id = job.id;
        self.executed += 1;

        debug!(
            job_id = %job_id,
            task = %job.task,
            worker = %self.consumer,
            delivery_count = delivery.delivery_count(),
            "executing job"
        );

        if !self.config.acks_late {
            self.ack(delivery).await;
        }

        match self.queue.is_revoked(job_id).await {
            Ok(true) => {
                info!(job_id = %job_id, worker = %self.consumer, "job revoked before start, skipping");
                let record = JobRecord::revoked(job_id, Some(self.id), None, "revoked before start");
                return self.finish(delivery, record).await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "could not check revocation, executing anyway");
            }
        }

        let Some(handler) = self.registry.get(&job.task) else {
            let record = JobRecord::failed(
                job_id,
                self.id,
                None,
                format!("no handler registered for task '{}'", job.task),
            );
            return self.finish(delivery, record).await;
        };

        let started = JobRecord::started(job_id, self.id);
        let started_at = started.started_at.unwrap_or_else(Utc::now);
        if let Err(e) = self.results.write(started).await {
            warn!(job_id = %job_id, error = %e, "failed to record job start");
        }

        let ctx = JobContext::new(job_id, delivery.delivery_count());
        let outcome = self
            .supervise(delivery, handler, ctx.clone(), job.payload.clone())
            .await;

        let record = match outcome {
            Ok(value) => JobRecord::succeeded(job_id, self.id, started_at, value),
            Err(_) if ctx.cancel_reason() == Some(CancelReason::ConnectionLost) => {
                warn!(
                    job_id = %job_id,
                    worker = %self.consumer,
                    "broker connection lost, leaving job for redelivery"
                );
                return Execution::Abandoned {
                    job_id,
                    reason: "broker connection lost".to_string(),
                };
            }
            Err(failure) => self.failure_record(job_id, started_at, &ctx, failure),
        };

        self.finish(delivery, record).await
    }

    /// Run the handler on its own task and drive the cancellation context.
    async fn supervise(
        &self,
        delivery: &Delivery,
        handler: std::sync::Arc<dyn JobHandler>,
        ctx: JobContext,
        payload: Value,
    ) -> Result<Value, Failure> {
        let job_id = ctx.job_id();
        let handler_ctx = ctx.clone();
        let mut task = tokio::spawn(async move { handler.handle(handler_ctx, payload).await });

        let soft_limit = tokio::time::sleep(self.config.soft_time_limit);
        tokio::pin!(soft_limit);

        // Also the keep-alive period, so it must stay below the visibility timeout.
        let mut heartbeat = tokio::time::interval(self.config.revoke_check_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = &mut soft_limit, if !ctx.is_cancelled() => {
                    warn!(
                        job_id = %job_id,
                        limit_secs = self.config.soft_time_limit.as_secs(),
                        "soft time limit exceeded, cancelling"
                    );
                    ctx.cancel(CancelReason::SoftTimeLimit);
                }
                _ = heartbeat.tick() => {
                    if self.config.acks_late {
                        self.keep_alive(delivery).await;
                    }
                    if !ctx.is_cancelled() {
                        self.check_revoked(&ctx).await;
                    }
                }
            }
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Failure::Handler(e)),
            Err(e) if e.is_panic() => Err(Failure::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(Failure::Aborted(e.to_string())),
        }
    }

    /// Push back the delivery's visibility timeout while the handler runs.
    async fn keep_alive(&self, delivery: &Delivery) {
        match self.queue.extend(delivery).await {
            Ok(()) => {}
            Err(QueueError::UnknownDelivery(_)) => warn!(
                job_id = %delivery.job_id(),
                receipt = %delivery.receipt(),
                "delivery no longer owned while running, job may run twice"
            ),
            Err(e) => debug!(job_id = %delivery.job_id(), error = %e, "failed to extend delivery"),
        }
    }

    async fn check_revoked(&self, ctx: &JobContext) {
        let job_id = ctx.job_id();
        match self.queue.is_revoked(job_id).await {
            Ok(true) => {
                info!(job_id = %job_id, "revocation received, cancelling");
                ctx.cancel(CancelReason::Revoked);
            }
            Ok(false) => {}
            Err(e) if e.is_unavailable() && self.config.cancel_on_connection_loss => {
                warn!(job_id = %job_id, error = %e, "broker unreachable, cancelling");
                ctx.cancel(CancelReason::ConnectionLost);
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "revocation check failed");
            }
        }
    }

    fn failure_record(
        &self,
        job_id: JobId,
        started_at: chrono::DateTime<Utc>,
        ctx: &JobContext,
        failure: Failure,
    ) -> JobRecord {
        let started_at = Some(started_at);
        match failure {
            Failure::Handler(HandlerError::Cancelled) => match ctx.cancel_reason() {
                Some(CancelReason::Revoked) => {
                    JobRecord::revoked(job_id, Some(self.id), started_at, "revoked while running")
                }
                Some(CancelReason::SoftTimeLimit) => JobRecord::failed(
                    job_id,
                    self.id,
                    started_at,
                    format!(
                        "soft time limit exceeded ({})",
                        humanize(self.config.soft_time_limit)
                    ),
                ),
                _ => JobRecord::failed(job_id, self.id, started_at, "cancelled"),
            },
            Failure::Handler(e) => JobRecord::failed(job_id, self.id, started_at, e.to_string()),
            Failure::Panicked(msg) => {
                JobRecord::failed(job_id, self.id, started_at, format!("handler panicked: {msg}"))
            }
            Failure::Aborted(msg) => JobRecord::failed(job_id, self.id, started_at, msg),
        }
    }

    /// Write the terminal record, then settle the delivery.
    async fn finish(&self, delivery: &Delivery, record: JobRecord) -> Execution {
        let job_id = record.job_id;

        match self.results.write(record.clone()).await {
            Ok(decision) => {
                match (decision, record.state) {
                    (WriteDecision::Ignore, _) => info!(
                        job_id = %job_id,
                        state = %record.state,
                        "terminal result already recorded, keeping the first"
                    ),
                    (WriteDecision::Apply, JobState::Failed) => error!(
                        job_id = %job_id,
                        worker = %self.consumer,
                        error = record.error.as_deref().unwrap_or_default(),
                        "job failed"
                    ),
                    (WriteDecision::Apply, state) => {
                        info!(job_id = %job_id, worker = %self.consumer, state = %state, "job finished")
                    }
                }

                if self.config.acks_late {
                    self.ack(delivery).await;
                }
                Execution::Finished { record, decision }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to write terminal result");
                if self.config.acks_late {
                    if let Err(e) = self.queue.reject(delivery, true).await {
                        warn!(job_id = %job_id, error = %e, "failed to requeue job");
                    }
                }
                Execution::Abandoned {
                    job_id,
                    reason: format!("result write failed: {e}"),
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.queue.ack(delivery).await {
            Ok(()) => debug!(job_id = %delivery.job_id(), receipt = %delivery.receipt(), "acked"),
            Err(QueueError::UnknownDelivery(_)) => warn!(
                job_id = %delivery.job_id(),
                receipt = %delivery.receipt(),
                "delivery no longer owned, job may run again"
            ),
            Err(e) => warn!(job_id = %delivery.job_id(), error = %e, "failed to ack"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn humanize(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;
    use taskbridge_core::NewJob;
    use taskbridge_queue::{InMemoryJobQueue, InMemoryResultStore};

    use crate::jobs::echo::{DelayEchoHandler, PROCESS_RESULT, PROCESS_TASK};
    use crate::jobs::handler::handler_fn;

    type TestWorker = Worker<Arc<InMemoryJobQueue>, Arc<InMemoryResultStore>>;

    struct Fixture {
        queue: Arc<InMemoryJobQueue>,
        results: Arc<InMemoryResultStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(InMemoryJobQueue::new()),
                results: Arc::new(InMemoryResultStore::new()),
            }
        }

        fn worker(&self, registry: HandlerRegistry) -> TestWorker {
            self.worker_with(registry, WorkerConfig::default())
        }

        fn worker_with(&self, registry: HandlerRegistry, config: WorkerConfig) -> TestWorker {
            Worker::new(
                "test-worker",
                Arc::clone(&self.queue),
                Arc::clone(&self.results),
                registry,
                config,
            )
        }

        async fn submit(&self, task: &str, payload: Value) -> Delivery {
            self.queue.enqueue(NewJob::new(task, payload)).await.unwrap();
            self.queue.claim("test-worker").await.unwrap()
        }

        async fn record(&self, id: JobId) -> JobRecord {
            self.results.get(id).await.unwrap().unwrap()
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, _ctx: JobContext, _payload: Value) -> Result<Value, HandlerError> {
            panic!("boom")
        }
    }

    fn echo_registry() -> HandlerRegistry {
        HandlerRegistry::new().with(PROCESS_TASK, DelayEchoHandler)
    }

    #[tokio::test]
    async fn success_is_recorded_then_acked() {
        let fx = Fixture::new();
        let mut worker = fx.worker(echo_registry());
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": 0})).await;

        let exec = worker.execute(&delivery).await;

        assert_eq!(exec.state(), Some(JobState::Succeeded));
        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.result, Some(json!(PROCESS_RESULT)));
        assert_eq!(record.worker_id, Some(worker.id()));
        assert!(record.started_at.is_some());
        assert_eq!(fx.queue.in_flight_len(), 0);
        assert_eq!(worker.executed(), 1);
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_record() {
        let fx = Fixture::new();
        let registry = HandlerRegistry::new().with(
            "explode",
            handler_fn(|_, _| async { Err(HandlerError::failed("disk on fire")) }),
        );
        let mut worker = fx.worker(registry);
        let delivery = fx.submit("explode", Value::Null).await;

        let exec = worker.execute(&delivery).await;

        assert_eq!(exec.state(), Some(JobState::Failed));
        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.error.as_deref(), Some("disk on fire"));
        assert_eq!(fx.queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn panic_becomes_failed_record() {
        let fx = Fixture::new();
        let registry = HandlerRegistry::new().with("panics", Panicking);
        let mut worker = fx.worker(registry);
        let delivery = fx.submit("panics", Value::Null).await;

        worker.execute(&delivery).await;

        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.as_deref(), Some("handler panicked: boom"));
    }

    #[tokio::test]
    async fn unknown_task_fails_without_running() {
        let fx = Fixture::new();
        let mut worker = fx.worker(echo_registry());
        let delivery = fx.submit("nope", Value::Null).await;

        worker.execute(&delivery).await;

        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn invalid_payload_is_a_failure() {
        let fx = Fixture::new();
        let mut worker = fx.worker(echo_registry());
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": "soon"})).await;

        worker.execute(&delivery).await;

        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.unwrap().starts_with("invalid payload"));
    }

    #[tokio::test]
    async fn revoked_job_is_skipped() {
        let fx = Fixture::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let registry = HandlerRegistry::new().with(
            "work",
            handler_fn(move |_, _| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );
        let mut worker = fx.worker(registry);
        let delivery = fx.submit("work", Value::Null).await;
        fx.queue.revoke(delivery.job_id()).await.unwrap();

        let exec = worker.execute(&delivery).await;

        assert_eq!(exec.state(), Some(JobState::Revoked));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(fx.queue.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_cancels_cooperative_handler() {
        let fx = Fixture::new();
        let mut worker = fx.worker(echo_registry());
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": 20})).await;
        let job_id = delivery.job_id();

        let queue = Arc::clone(&fx.queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            queue.revoke(job_id).await.unwrap();
        });

        let started = tokio::time::Instant::now();
        let exec = worker.execute(&delivery).await;

        assert_eq!(exec.state(), Some(JobState::Revoked));
        assert!(started.elapsed() < Duration::from_secs(3));
        let record = fx.record(job_id).await;
        assert_eq!(record.error.as_deref(), Some("revoked while running"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_cooperative_handler_still_completes_after_revoke() {
        let fx = Fixture::new();
        let registry = HandlerRegistry::new().with(
            "stubborn",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("finished anyway"))
            }),
        );
        let mut worker = fx.worker(registry);
        let delivery = fx.submit("stubborn", Value::Null).await;
        let job_id = delivery.job_id();

        let queue = Arc::clone(&fx.queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            queue.revoke(job_id).await.unwrap();
        });

        let exec = worker.execute(&delivery).await;

        assert_eq!(exec.state(), Some(JobState::Succeeded));
        assert_eq!(fx.record(job_id).await.result, Some(json!("finished anyway")));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_time_limit_fails_the_job() {
        let fx = Fixture::new();
        let config = WorkerConfig::default().with_soft_time_limit(Duration::from_secs(5));
        let mut worker = fx.worker_with(echo_registry(), config);
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": 60})).await;

        let exec = worker.execute(&delivery).await;

        assert_eq!(exec.state(), Some(JobState::Failed));
        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.error.as_deref(), Some("soft time limit exceeded (5s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_leaves_job_for_redelivery() {
        let fx = Fixture::new();
        let mut worker = fx.worker(echo_registry());
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": 20})).await;

        let queue = Arc::clone(&fx.queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            queue.set_available(false);
        });

        let exec = worker.execute(&delivery).await;

        assert!(matches!(exec, Execution::Abandoned { .. }));
        let record = fx.record(delivery.job_id()).await;
        assert_eq!(record.state, JobState::Started);

        fx.queue.set_available(true);
        assert_eq!(fx.queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn failed_result_write_requeues() {
        let fx = Fixture::new();
        let mut worker = fx.worker(echo_registry());
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": 0})).await;
        fx.results.set_available(false);

        let exec = worker.execute(&delivery).await;

        assert!(matches!(exec, Execution::Abandoned { .. }));
        assert_eq!(fx.queue.in_flight_len(), 0);
        assert_eq!(fx.queue.ready_len(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_keeps_first_result() {
        let fx = Fixture::new();
        let delivery = fx.submit(PROCESS_TASK, json!({"delay": 0})).await;
        let job_id = delivery.job_id();
        fx.results
            .write(JobRecord::failed(job_id, WorkerId::new(), None, "first run"))
            .await
            .unwrap();

        let mut worker = fx.worker(echo_registry());
        let exec = worker.execute(&delivery).await;

        assert!(exec.is_duplicate());
        assert_eq!(fx.record(job_id).await.error.as_deref(), Some("first run"));
        assert_eq!(fx.queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn slot_is_exhausted_after_max_jobs() {
        let fx = Fixture::new();
        let config = WorkerConfig::default().with_max_jobs_per_worker(Some(2));
        let mut worker = fx.worker_with(echo_registry(), config);

        for _ in 0..2 {
            assert!(!worker.is_exhausted());
            let delivery = fx.submit(PROCESS_TASK, json!({})).await;
            worker.execute(&delivery).await;
        }

        assert!(worker.is_exhausted());
    }
}
