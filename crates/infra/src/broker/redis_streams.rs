//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream Key**: `taskbridge:jobs`, one entry per delivery attempt
//! - **Consumer Group**: `taskbridge:workers`, every worker slot is a named
//!   consumer inside it
//! - **Late ack**: an entry stays in the group's pending list until `XACK`
//! - **Redelivery**: entries idle longer than the visibility timeout are
//!   taken over with `XPENDING`/`XCLAIM`
//! - **Ownership**: a receipt names the entry and the consumer holding it.
//!   Ack, reject and extend run as Lua scripts that first check the entry is
//!   still pending for that consumer, so a stale receipt changes nothing
//! - **Dead-Letter Queue**: `taskbridge:jobs:dlq`
//! - **Revocations**: `taskbridge:revoked:{job_id}` keys with a TTL
//!
//! The `redis` client used here is synchronous, so every operation runs on
//! the blocking thread pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use taskbridge_core::{Job, JobId, NewJob};
use taskbridge_queue::{Delivery, DeliveryReceipt, JobQueue, QueueError};

use crate::config::BrokerConfig;

const DEFAULT_STREAM_KEY: &str = "taskbridge:jobs";
const DEFAULT_GROUP: &str = "taskbridge:workers";
const DEFAULT_DLQ_KEY: &str = "taskbridge:jobs:dlq";
const REVOKED_PREFIX: &str = "taskbridge:revoked:";

/// How long a blocking `XREADGROUP` waits before the claim loop rescans.
const CLAIM_BLOCK_MS: u64 = 1000;

/// Backoff between connection attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// KEYS: stream, append target. ARGV: group, entry id, consumer, then
/// optional field/value pairs to `XADD` to the target before the entry is
/// acked and deleted. Returns 0 when the consumer no longer holds the entry.
static SETTLE_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local owned = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1, ARGV[3])
if #owned == 0 then
  return 0
end
if #ARGV > 3 then
  redis.call('XADD', KEYS[2], '*', unpack(ARGV, 4))
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
",
    )
});

/// KEYS: stream. ARGV: group, entry id, consumer. Resets the idle time of
/// an entry the consumer still holds.
static EXTEND_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local owned = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1, ARGV[3])
if #owned == 0 then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
return 1
",
    )
});

#[derive(Debug, thiserror::Error)]
pub enum RedisQueueError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<RedisQueueError> for QueueError {
    fn from(e: RedisQueueError) -> Self {
        match e {
            RedisQueueError::Connection(msg) => QueueError::Unavailable(msg),
            RedisQueueError::Serialization(msg) | RedisQueueError::Deserialization(msg) => {
                QueueError::Serialization(msg)
            }
            RedisQueueError::Command(msg) => QueueError::Internal(msg),
        }
    }
}

/// Open a connection, retrying `max_retries` times.
pub(super) fn connect(
    client: &redis::Client,
    max_retries: u32,
) -> Result<redis::Connection, RedisQueueError> {
    let mut attempt = 0;
    loop {
        match client.get_connection() {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(attempt, max_retries, error = %e, "Redis connection failed, retrying");
                std::thread::sleep(RETRY_BACKOFF);
            }
            Err(e) => return Err(RedisQueueError::Connection(e.to_string())),
        }
    }
}

/// Map a command error, treating I/O failures as connection loss.
pub(super) fn command_error(what: &str, e: redis::RedisError) -> RedisQueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        RedisQueueError::Connection(format!("{what} failed: {e}"))
    } else {
        RedisQueueError::Command(format!("{what} failed: {e}"))
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    dlq_key: String,
    max_retries: u32,
    visibility_timeout: Duration,
    max_redeliveries: Option<u32>,
    revoke_ttl: Duration,
    group_ready: Arc<AtomicBool>,
}

/// One parsed stream entry.
#[derive(Debug, Clone)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

/// A pending entry together with the consumer it was handed to.
///
/// Encoded into a [`DeliveryReceipt`] as `{entry_id}:{consumer}`. Entry ids
/// never contain `:`, consumer names may.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    entry_id: String,
    consumer: String,
}

impl Claim {
    fn new(entry_id: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            consumer: consumer.into(),
        }
    }

    fn receipt(&self) -> DeliveryReceipt {
        DeliveryReceipt::new(format!("{}:{}", self.entry_id, self.consumer))
    }

    fn from_receipt(receipt: &DeliveryReceipt) -> Option<Self> {
        let (entry_id, consumer) = receipt.as_str().split_once(':')?;
        if entry_id.is_empty() || consumer.is_empty() {
            return None;
        }
        Some(Self::new(entry_id, consumer))
    }
}

impl RedisStreamsJobQueue {
    pub fn open(config: &BrokerConfig) -> Result<Self, RedisQueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisQueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            max_retries: config.max_retries,
            visibility_timeout: config.visibility_timeout,
            max_redeliveries: config.max_redeliveries,
            revoke_ttl: config.result_ttl,
            group_ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Use a different stream (and derived group/DLQ keys), e.g. per test.
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        let stream_key = stream_key.into();
        self.group = format!("{stream_key}:workers");
        self.dlq_key = format!("{stream_key}:dlq");
        self.stream_key = stream_key;
        self
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, RedisQueueError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| QueueError::Internal(format!("blocking task failed: {e}")))?
            .map_err(QueueError::from)
    }

    fn connection(&self) -> Result<redis::Connection, RedisQueueError> {
        connect(&self.client, self.max_retries)
    }

    /// Ensure the consumer group exists (idempotent).
    fn ensure_group(&self, conn: &mut redis::Connection) -> Result<(), RedisQueueError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        // "0" so the group also sees entries added before it existed.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(command_error("XGROUP CREATE", e)),
        }

        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn add_sync(
        &self,
        conn: &mut redis::Connection,
        job: &Job,
        deliveries: u32,
    ) -> Result<String, RedisQueueError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| RedisQueueError::Serialization(e.to_string()))?;

        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(job.id.to_string())
            .arg("deliveries")
            .arg(deliveries.to_string())
            .arg("payload")
            .arg(&payload)
            .query(conn)
            .map_err(|e| command_error("XADD", e))
    }

    fn enqueue_sync(&self, new: NewJob) -> Result<JobId, RedisQueueError> {
        let job = Job::from_new(new);
        let mut conn = self.connection()?;
        let entry_id = self.add_sync(&mut conn, &job, 0)?;

        debug!(job_id = %job.id, entry_id = %entry_id, "job added to stream");
        Ok(job.id)
    }

    /// Claim one entry: an idle pending entry first, otherwise a new one.
    fn claim_sync(&self, consumer: &str) -> Result<Option<Delivery>, RedisQueueError> {
        let mut conn = self.connection()?;
        self.ensure_group(&mut conn)?;

        if let Some((entry, times_delivered)) = self.reclaim_idle_sync(&mut conn, consumer)? {
            return self.deliver(&mut conn, consumer, entry, times_delivered);
        }

        match self.read_new_sync(&mut conn, consumer)? {
            Some(entry) => self.deliver(&mut conn, consumer, entry, 1),
            None => Ok(None),
        }
    }

    /// Take over the oldest entry idle for longer than the visibility timeout.
    fn reclaim_idle_sync(
        &self,
        conn: &mut redis::Connection,
        consumer: &str,
    ) -> Result<Option<(StreamEntry, u32)>, RedisQueueError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as u64;

        // (id, consumer, idle_ms, times_delivered)
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn)
            .map_err(|e| command_error("XPENDING", e))?;

        let Some((id, previous_owner, idle_ms, times_delivered)) = pending.into_iter().next()
        else {
            return Ok(None);
        };

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&id)
            .query(conn)
            .map_err(|e| command_error("XCLAIM", e))?;

        let Some(entry) = claimed.into_iter().find_map(|v| parse_entry(v).ok()) else {
            // Claimed by someone else in between, or the entry was deleted.
            return Ok(None);
        };

        warn!(
            entry_id = %id,
            previous_owner = %previous_owner,
            idle_ms,
            "redelivering unacknowledged job"
        );
        Ok(Some((entry, times_delivered as u32 + 1)))
    }

    fn read_new_sync(
        &self,
        conn: &mut redis::Connection,
        consumer: &str,
    ) -> Result<Option<StreamEntry>, RedisQueueError> {
        // [[stream_key, [entry, ...]]], or nil when BLOCK times out.
        let reply: Option<Vec<(String, Vec<redis::Value>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(CLAIM_BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| command_error("XREADGROUP", e))?;

        let entry = reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .find_map(|v| parse_entry(v).ok());
        Ok(entry)
    }

    /// Turn a claimed entry into a delivery, dead-lettering it if it has
    /// been delivered too often or cannot be decoded.
    fn deliver(
        &self,
        conn: &mut redis::Connection,
        consumer: &str,
        entry: StreamEntry,
        times_delivered: u32,
    ) -> Result<Option<Delivery>, RedisQueueError> {
        let prior: u32 = entry
            .fields
            .get("deliveries")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let delivery_count = prior + times_delivered;
        let claim = Claim::new(entry.id.as_str(), consumer);

        let job = match decode_job(&entry) {
            Ok(job) => job,
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "undecodable job entry");
                self.dead_letter_sync(conn, &claim, &entry, delivery_count, &e.to_string())?;
                return Ok(None);
            }
        };

        if let Some(max) = self.max_redeliveries {
            if delivery_count > max.saturating_add(1) {
                self.dead_letter_sync(
                    conn,
                    &claim,
                    &entry,
                    delivery_count,
                    "redelivery limit exceeded",
                )?;
                return Ok(None);
            }
        }

        Ok(Some(Delivery::new(job, claim.receipt(), delivery_count)))
    }

    fn dead_letter_sync(
        &self,
        conn: &mut redis::Connection,
        claim: &Claim,
        entry: &StreamEntry,
        delivery_count: u32,
        reason: &str,
    ) -> Result<(), RedisQueueError> {
        let payload = entry.fields.get("payload").cloned().unwrap_or_default();
        let fields = [
            ("original_entry_id", entry.id.clone()),
            ("deliveries", delivery_count.to_string()),
            ("reason", reason.to_string()),
            ("failed_at", chrono::Utc::now().to_rfc3339()),
            ("payload", payload),
        ];

        if !self.settle_sync(conn, claim, &self.dlq_key, &fields)? {
            debug!(entry_id = %entry.id, "entry taken over before it could be dead-lettered");
            return Ok(());
        }

        warn!(
            entry_id = %entry.id,
            deliveries = delivery_count,
            reason,
            "job sent to dead-letter queue"
        );
        Ok(())
    }

    /// Append `fields` to `target` (if any), then `XACK` and `XDEL` the
    /// entry, all only while `claim.consumer` still holds it. Returns
    /// whether it did.
    fn settle_sync(
        &self,
        conn: &mut redis::Connection,
        claim: &Claim,
        target: &str,
        fields: &[(&str, String)],
    ) -> Result<bool, RedisQueueError> {
        let mut invocation = SETTLE_SCRIPT.prepare_invoke();
        invocation
            .key(&self.stream_key)
            .key(target)
            .arg(&self.group)
            .arg(&claim.entry_id)
            .arg(&claim.consumer);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }

        let settled: u64 = invocation
            .invoke(conn)
            .map_err(|e| command_error("settle script", e))?;
        Ok(settled > 0)
    }

    fn ack_sync(&self, receipt: &DeliveryReceipt) -> Result<bool, RedisQueueError> {
        let Some(claim) = Claim::from_receipt(receipt) else {
            return Ok(false);
        };
        let mut conn = self.connection()?;
        self.settle_sync(&mut conn, &claim, &self.stream_key, &[])
    }

    fn reject_sync(&self, delivery: &Delivery, requeue: bool) -> Result<bool, RedisQueueError> {
        let Some(claim) = Claim::from_receipt(delivery.receipt()) else {
            return Ok(false);
        };
        let fields = if requeue {
            let job = delivery.job();
            let payload = serde_json::to_string(job)
                .map_err(|e| RedisQueueError::Serialization(e.to_string()))?;
            vec![
                ("job_id", job.id.to_string()),
                ("deliveries", delivery.delivery_count().to_string()),
                ("payload", payload),
            ]
        } else {
            Vec::new()
        };

        let mut conn = self.connection()?;
        self.settle_sync(&mut conn, &claim, &self.stream_key, &fields)
    }

    fn extend_sync(&self, receipt: &DeliveryReceipt) -> Result<bool, RedisQueueError> {
        let Some(claim) = Claim::from_receipt(receipt) else {
            return Ok(false);
        };
        let mut conn = self.connection()?;
        let extended: u64 = EXTEND_SCRIPT
            .key(&self.stream_key)
            .arg(&self.group)
            .arg(&claim.entry_id)
            .arg(&claim.consumer)
            .invoke(&mut conn)
            .map_err(|e| command_error("extend script", e))?;
        Ok(extended > 0)
    }

    fn revoke_sync(&self, job_id: JobId) -> Result<(), RedisQueueError> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(revoked_key(job_id))
            .arg(1)
            .arg("EX")
            .arg(self.revoke_ttl.as_secs().max(1))
            .query(&mut conn)
            .map_err(|e| command_error("SET", e))?;
        Ok(())
    }

    fn is_revoked_sync(&self, job_id: JobId) -> Result<bool, RedisQueueError> {
        let mut conn = self.connection()?;
        let exists: u64 = redis::cmd("EXISTS")
            .arg(revoked_key(job_id))
            .query(&mut conn)
            .map_err(|e| command_error("EXISTS", e))?;
        Ok(exists > 0)
    }
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.run_blocking(move |q| q.enqueue_sync(job)).await
    }

    async fn claim(&self, consumer: &str) -> Result<Delivery, QueueError> {
        loop {
            let name = consumer.to_string();
            if let Some(delivery) = self.run_blocking(move |q| q.claim_sync(&name)).await? {
                return Ok(delivery);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let receipt = delivery.receipt().clone();
        let owned = self.run_blocking(move |q| q.ack_sync(&receipt)).await?;
        if owned {
            Ok(())
        } else {
            Err(QueueError::UnknownDelivery(delivery.receipt().to_string()))
        }
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let owned_delivery = delivery.clone();
        let owned = self
            .run_blocking(move |q| q.reject_sync(&owned_delivery, requeue))
            .await?;
        if owned {
            Ok(())
        } else {
            Err(QueueError::UnknownDelivery(delivery.receipt().to_string()))
        }
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let receipt = delivery.receipt().clone();
        let owned = self.run_blocking(move |q| q.extend_sync(&receipt)).await?;
        if owned {
            Ok(())
        } else {
            Err(QueueError::UnknownDelivery(delivery.receipt().to_string()))
        }
    }

    async fn revoke(&self, job_id: JobId) -> Result<(), QueueError> {
        self.run_blocking(move |q| q.revoke_sync(job_id)).await
    }

    async fn is_revoked(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.run_blocking(move |q| q.is_revoked_sync(job_id)).await
    }
}

fn revoked_key(job_id: JobId) -> String {
    format!("{REVOKED_PREFIX}{job_id}")
}

fn decode_job(entry: &StreamEntry) -> Result<Job, RedisQueueError> {
    let payload = entry
        .fields
        .get("payload")
        .ok_or_else(|| RedisQueueError::Deserialization("missing payload field".to_string()))?;
    serde_json::from_str(payload).map_err(|e| RedisQueueError::Deserialization(e.to_string()))
}

/// Parse `[entry_id, [field, value, ...]]`.
fn parse_entry(value: redis::Value) -> Result<StreamEntry, RedisQueueError> {
    let redis::Value::Bulk(parts) = value else {
        return Err(RedisQueueError::Deserialization("invalid entry format".to_string()));
    };

    let mut parts = parts.into_iter();
    let id = match parts.next() {
        Some(redis::Value::Data(data)) => String::from_utf8_lossy(&data).into_owned(),
        Some(redis::Value::Status(s)) => s,
        _ => {
            return Err(RedisQueueError::Deserialization(
                "invalid entry id".to_string(),
            ));
        }
    };

    let Some(redis::Value::Bulk(raw_fields)) = parts.next() else {
        return Err(RedisQueueError::Deserialization(format!(
            "entry {id} has no fields"
        )));
    };

    let fields = raw_fields
        .chunks(2)
        .filter_map(|pair| match pair {
            [redis::Value::Data(k), redis::Value::Data(v)] => Some((
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            )),
            _ => None,
        })
        .collect();

    Ok(StreamEntry { id, fields })
}
