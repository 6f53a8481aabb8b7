//! Fixed-size pool of worker slots.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use taskbridge_core::JobState;
use taskbridge_queue::{JobQueue, ResultStore};

use super::handler::HandlerRegistry;
use super::worker::{Execution, Worker};
use crate::config::WorkerConfig;

/// Builds the handler set for a fresh worker slot.
pub type RegistryFactory = Arc<dyn Fn() -> HandlerRegistry + Send + Sync>;

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_revoked: u64,
    /// Deliveries left for redelivery without a terminal record.
    pub jobs_abandoned: u64,
    /// Terminal writes dropped because a record already existed.
    pub duplicates_ignored: u64,
    pub slots_recycled: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl PoolStats {
    fn record(&mut self, execution: &Execution) {
        self.jobs_processed += 1;
        if execution.is_duplicate() {
            self.duplicates_ignored += 1;
            return;
        }
        match execution.state() {
            Some(JobState::Succeeded) => self.jobs_succeeded += 1,
            Some(JobState::Failed) => self.jobs_failed += 1,
            Some(JobState::Revoked) => self.jobs_revoked += 1,
            _ => self.jobs_abandoned += 1,
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    slots: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for slot in self.slots {
            if let Err(e) = slot.await {
                error!(error = %e, "worker slot ended abnormally");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }
}

/// N worker slots sharing one queue and result store.
///
/// Each slot processes one job fully before claiming the next. After
/// `max_jobs_per_worker` jobs a slot retires and is replaced by a new worker
/// with a freshly built handler registry.
pub struct WorkerPool<Q, R> {
    queue: Q,
    results: R,
    registry: RegistryFactory,
    config: WorkerConfig,
    name: String,
}

impl<Q, R> WorkerPool<Q, R>
where
    Q: JobQueue + Clone + 'static,
    R: ResultStore + Clone + 'static,
{
    pub fn new<F>(queue: Q, results: R, registry: F, config: WorkerConfig) -> Self
    where
        F: Fn() -> HandlerRegistry + Send + Sync + 'static,
    {
        Self {
            queue,
            results,
            registry: Arc::new(registry),
            config,
            name: "worker".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Spawn all slots on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        info!(
            pool = %self.name,
            concurrency = self.config.concurrency,
            max_jobs_per_worker = ?self.config.max_jobs_per_worker,
            "starting worker pool"
        );

        let slots = (0..self.config.concurrency)
            .map(|index| {
                let slot = Slot {
                    consumer: format!("{}-{}", self.name, index),
                    queue: self.queue.clone(),
                    results: self.results.clone(),
                    registry: Arc::clone(&self.registry),
                    config: self.config.clone(),
                    shutdown: shutdown.clone(),
                    stats: Arc::clone(&stats),
                };
                tokio::spawn(slot.run())
            })
            .collect();

        WorkerPoolHandle {
            shutdown,
            slots,
            stats,
            started: Instant::now(),
        }
    }
}

struct Slot<Q, R> {
    consumer: String,
    queue: Q,
    results: R,
    registry: RegistryFactory,
    config: WorkerConfig,
    shutdown: CancellationToken,
    stats: Arc<Mutex<PoolStats>>,
}

impl<Q, R> Slot<Q, R>
where
    Q: JobQueue + Clone + 'static,
    R: ResultStore + Clone + 'static,
{
    async fn run(self) {
        loop {
            let worker = Worker::new(
                self.consumer.clone(),
                self.queue.clone(),
                self.results.clone(),
                (self.registry)(),
                self.config.clone(),
            );
            info!(worker = %self.consumer, worker_id = %worker.id(), "worker slot started");

            let retired = self.drive(worker).await;
            if !retired {
                info!(worker = %self.consumer, "worker slot stopped");
                return;
            }

            info!(worker = %self.consumer, "worker slot recycled");
            self.update(|s| s.slots_recycled += 1);
        }
    }

    /// Process jobs until the worker is exhausted (`true`) or shutdown (`false`).
    async fn drive(&self, mut worker: Worker<Q, R>) -> bool {
        while !worker.is_exhausted() {
            let claimed = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                claimed = worker.claim() => claimed,
            };

            match claimed {
                Ok(delivery) => {
                    self.update(|s| s.current_running += 1);
                    let execution = worker.execute(&delivery).await;
                    self.update(|s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        s.record(&execution);
                    });
                }
                Err(e) => {
                    error!(worker = %self.consumer, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.claim_retry_interval) => {}
                    }
                }
            }
        }
        true
    }

    fn update(&self, f: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
