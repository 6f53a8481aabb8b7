//! Redis-backed result store.
//!
//! One JSON document per job at `taskbridge:result:{job_id}`, expiring after
//! the configured result TTL. Writes use `WATCH`/`MULTI`/`EXEC` so the
//! monotonic check and the `SET` happen atomically per key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use taskbridge_core::{JobId, JobRecord, WriteDecision};
use taskbridge_queue::{ResultStore, ResultStoreError};

use super::redis_streams::{RedisQueueError, command_error, connect};
use crate::config::BrokerConfig;

const RESULT_PREFIX: &str = "taskbridge:result:";

#[derive(Debug, Clone)]
pub struct RedisResultStore {
    client: Arc<redis::Client>,
    max_retries: u32,
    ttl: Duration,
}

impl From<RedisQueueError> for ResultStoreError {
    fn from(e: RedisQueueError) -> Self {
        match e {
            RedisQueueError::Connection(msg) => ResultStoreError::Unavailable(msg),
            RedisQueueError::Serialization(msg) | RedisQueueError::Deserialization(msg) => {
                ResultStoreError::Serialization(msg)
            }
            RedisQueueError::Command(msg) => ResultStoreError::Internal(msg),
        }
    }
}

impl RedisResultStore {
    pub fn open(config: &BrokerConfig) -> Result<Self, RedisQueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisQueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            max_retries: config.max_retries,
            ttl: config.result_ttl,
        })
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, ResultStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, RedisQueueError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| ResultStoreError::Internal(format!("blocking task failed: {e}")))?
            .map_err(ResultStoreError::from)
    }

    fn write_sync(&self, record: JobRecord) -> Result<WriteDecision, RedisQueueError> {
        let key = result_key(record.job_id);
        let ttl_secs = self.ttl.as_secs().max(1);
        let mut conn = connect(&self.client, self.max_retries)?;

        redis::transaction(&mut conn, &[&key], |con, pipe| {
            let current: Option<String> = redis::cmd("GET").arg(&key).query(con)?;
            let existing = match current.as_deref().map(serde_json::from_str::<JobRecord>) {
                Some(Ok(stored)) => Some(stored),
                Some(Err(e)) => {
                    debug!(key = %key, error = %e, "overwriting undecodable result");
                    None
                }
                None => None,
            };

            if JobRecord::decide(existing.as_ref(), &record) == WriteDecision::Ignore {
                return Ok(Some(WriteDecision::Ignore));
            }

            let merged = record.clone().merged_with(existing.as_ref());
            let json = serde_json::to_string(&merged).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "result serialization failed",
                    e.to_string(),
                ))
            })?;

            let applied: Option<()> = pipe
                .cmd("SET")
                .arg(&key)
                .arg(json)
                .arg("EX")
                .arg(ttl_secs)
                .ignore()
                .query(con)?;
            Ok(applied.map(|_| WriteDecision::Apply))
        })
        .map_err(|e| command_error("result write", e))
    }

    fn get_sync(&self, job_id: JobId) -> Result<Option<JobRecord>, RedisQueueError> {
        let mut conn = connect(&self.client, self.max_retries)?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(result_key(job_id))
            .query(&mut conn)
            .map_err(|e| command_error("GET", e))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| RedisQueueError::Deserialization(e.to_string()))
        })
        .transpose()
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn write(&self, record: JobRecord) -> Result<WriteDecision, ResultStoreError> {
        self.run_blocking(move |s| s.write_sync(record)).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, ResultStoreError> {
        self.run_blocking(move |s| s.get_sync(job_id)).await
    }
}

fn result_key(job_id: JobId) -> String {
    format!("{RESULT_PREFIX}{job_id}")
}
