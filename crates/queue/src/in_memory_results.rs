//! In-memory result store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use taskbridge_core::{JobId, JobRecord, WriteDecision};

use crate::results::{ResultStore, ResultStoreError};

/// Default record lifetime, matching the broker's default result TTL.
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Expired records are swept at most this often, on write.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Entry {
    record: Option<JobRecord>,
    write_attempts: u32,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct Entries {
    by_job: HashMap<JobId, Entry>,
    next_sweep: Instant,
}

/// In-memory result store.
///
/// - Records expire `ttl` after their last write, like `SET EX` on Redis
/// - Writes are serialized per store, so each write is atomic per key
/// - `set_available(false)` simulates an unreachable backend
#[derive(Debug)]
pub struct InMemoryResultStore {
    entries: RwLock<Entries>,
    available: AtomicBool,
    ttl: Duration,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of writes received for `job_id`, applied or not.
    pub async fn write_attempts(&self, job_id: JobId) -> u32 {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .by_job
            .get(&job_id)
            .filter(|e| e.is_live(now))
            .map_or(0, |e| e.write_attempts)
    }

    /// Number of unexpired records.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .by_job
            .values()
            .filter(|e| e.record.is_some() && e.is_live(now))
            .count()
    }

    /// Number of entries held in memory, expired ones included.
    pub async fn retained(&self) -> usize {
        self.entries.read().await.by_job.len()
    }

    fn check_available(&self) -> Result<(), ResultStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResultStoreError::Unavailable(
                "in-memory result store is offline".to_string(),
            ))
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries {
                by_job: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            }),
            available: AtomicBool::new(true),
            ttl: DEFAULT_TTL,
        }
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn write(&self, record: JobRecord) -> Result<WriteDecision, ResultStoreError> {
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if now >= entries.next_sweep {
            entries.by_job.retain(|_, e| e.is_live(now));
            entries.next_sweep = now + SWEEP_INTERVAL;
        }

        let expires_at = now + self.ttl;
        let entry = entries.by_job.entry(record.job_id).or_insert(Entry {
            record: None,
            write_attempts: 0,
            expires_at,
        });
        if !entry.is_live(now) {
            entry.record = None;
            entry.write_attempts = 0;
        }
        entry.write_attempts += 1;
        entry.expires_at = expires_at;

        let decision = JobRecord::decide(entry.record.as_ref(), &record);
        if decision == WriteDecision::Apply {
            let merged = record.merged_with(entry.record.as_ref());
            entry.record = Some(merged);
        }

        Ok(decision)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, ResultStoreError> {
        self.check_available()?;

        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .by_job
            .get(&job_id)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.record.clone()))
    }
}
