//! In-memory job queue for tests/dev.
//!
//! Mirrors the delivery semantics of the broker-backed queue:
//!
//! - FIFO claiming
//! - Claimed jobs stay in flight until acked or rejected
//! - In-flight jobs are redelivered after the visibility timeout, or at once
//!   when their consumer is reported lost
//! - A consumer keeps a delivery invisible by extending it
//! - Optional redelivery cap; jobs over the cap are dead-lettered
//! - Revocations expire after the revocation TTL
//! - `set_available(false)` simulates a broker outage

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use taskbridge_core::{Job, JobId, NewJob};

use crate::queue::{Delivery, DeliveryReceipt, JobQueue, QueueError};

/// How often a waiting `claim` rescans for expired in-flight jobs.
const RESCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a claimed job may stay unacknowledged.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default lifetime of a revocation, matching the default result TTL.
const DEFAULT_REVOCATION_TTL: Duration = Duration::from_secs(3600);

/// A job that exceeded its redelivery cap.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: Job,
    pub deliveries: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Ready {
    job: Job,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    job: Job,
    deliveries: u32,
    consumer: String,
    visible_at: Instant,
}

#[derive(Debug)]
struct Revocation {
    calls: u32,
    expires_at: Instant,
}

#[derive(Debug)]
struct State {
    ready: VecDeque<Ready>,
    in_flight: HashMap<DeliveryReceipt, InFlight>,
    revoked: HashMap<JobId, Revocation>,
    dead_letters: Vec<DeadLetter>,
    available: bool,
    next_receipt: u64,
}

#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
    max_redeliveries: Option<u32>,
    revocation_ttl: Duration,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                revoked: HashMap::new(),
                dead_letters: Vec::new(),
                available: true,
                next_receipt: 0,
            }),
            notify: Notify::new(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_redeliveries: None,
            revocation_ttl: DEFAULT_REVOCATION_TTL,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Cap how many times a job may be redelivered (`0` = deliver once).
    pub fn with_max_redeliveries(mut self, max: Option<u32>) -> Self {
        self.max_redeliveries = max;
        self
    }

    /// How long a revocation is remembered after the last `revoke` call.
    pub fn with_revocation_ttl(mut self, ttl: Duration) -> Self {
        self.revocation_ttl = ttl;
        self
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.available = available;
        }
        if available {
            self.notify.notify_waiters();
        }
    }

    /// Requeue everything `consumer` holds, as a broker does when a worker's
    /// connection drops. Returns the number of requeued jobs.
    pub fn disconnect_consumer(&self, consumer: &str) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };

        let lost: Vec<DeliveryReceipt> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.consumer == consumer)
            .map(|(r, _)| r.clone())
            .collect();

        for receipt in &lost {
            if let Some(f) = state.in_flight.remove(receipt) {
                state.ready.push_front(Ready {
                    job: f.job,
                    deliveries: f.deliveries,
                });
            }
        }
        drop(state);

        if !lost.is_empty() {
            warn!(consumer, requeued = lost.len(), "consumer lost, requeued in-flight jobs");
            self.notify.notify_waiters();
        }
        lost.len()
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.ready.len())
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.in_flight.len())
    }

    /// How many times `revoke` was called for `job_id`, while the
    /// revocation is remembered.
    pub fn revoke_calls(&self, job_id: JobId) -> u32 {
        let now = Instant::now();
        self.state.lock().map_or(0, |s| {
            s.revoked
                .get(&job_id)
                .filter(|r| r.expires_at > now)
                .map_or(0, |r| r.calls)
        })
    }

    /// Revocations currently held, expired or not.
    pub fn revocations_len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.revoked.len())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .map_or_else(|_| Vec::new(), |s| s.dead_letters.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        let state = self
            .state
            .lock()
            .map_err(|_| QueueError::Internal("queue state lock poisoned".to_string()))?;

        if !state.available {
            return Err(QueueError::Unavailable(
                "in-memory broker is offline".to_string(),
            ));
        }
        Ok(state)
    }

    fn try_claim(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();

        // Redeliver anything whose visibility timeout elapsed.
        let expired: Vec<DeliveryReceipt> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(r, _)| r.clone())
            .collect();
        for receipt in expired {
            if let Some(f) = state.in_flight.remove(&receipt) {
                debug!(job_id = %f.job.id, consumer = %f.consumer, "visibility timeout elapsed, requeueing");
                state.ready.push_front(Ready {
                    job: f.job,
                    deliveries: f.deliveries,
                });
            }
        }

        while let Some(ready) = state.ready.pop_front() {
            let deliveries = ready.deliveries + 1;

            if let Some(max) = self.max_redeliveries {
                if deliveries > max.saturating_add(1) {
                    warn!(job_id = %ready.job.id, deliveries = ready.deliveries, "redelivery cap exceeded, dead-lettering job");
                    state.dead_letters.push(DeadLetter {
                        job: ready.job,
                        deliveries: ready.deliveries,
                        dead_lettered_at: Utc::now(),
                    });
                    continue;
                }
            }

            state.next_receipt += 1;
            let receipt = DeliveryReceipt::new(format!("mem-{}", state.next_receipt));
            state.in_flight.insert(
                receipt.clone(),
                InFlight {
                    job: ready.job.clone(),
                    deliveries,
                    consumer: consumer.to_string(),
                    visible_at: now + self.visibility_timeout,
                },
            );

            return Ok(Some(Delivery::new(ready.job, receipt, deliveries)));
        }

        Ok(None)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let job = Job::from_new(job);
        let id = job.id;
        {
            let mut state = self.lock()?;
            state.ready.push_back(Ready { job, deliveries: 0 });
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, consumer: &str) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.notify.notified();

            if let Some(delivery) = self.try_claim(consumer)? {
                return Ok(delivery);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
            }
        }
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let f = state
            .in_flight
            .get_mut(delivery.receipt())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.receipt().to_string()))?;
        f.visible_at = Instant::now() + self.visibility_timeout;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state
            .in_flight
            .remove(delivery.receipt())
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.receipt().to_string()))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let f = state
                .in_flight
                .remove(delivery.receipt())
                .ok_or_else(|| QueueError::UnknownDelivery(delivery.receipt().to_string()))?;

            if requeue {
                state.ready.push_front(Ready {
                    job: f.job,
                    deliveries: f.deliveries,
                });
            }
        }

        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn revoke(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.revoked.retain(|_, r| r.expires_at > now);

        let revocation = state.revoked.entry(job_id).or_insert(Revocation {
            calls: 0,
            expires_at: now,
        });
        revocation.calls += 1;
        revocation.expires_at = now + self.revocation_ttl;
        Ok(())
    }

    async fn is_revoked(&self, job_id: JobId) -> Result<bool, QueueError> {
        let state = self.lock()?;
        let now = Instant::now();
        Ok(state
            .revoked
            .get(&job_id)
            .is_some_and(|r| r.expires_at > now))
    }
}
