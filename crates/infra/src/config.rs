//! Configuration for the broker, workers and the dispatch bridge.
//!
//! Every section can be built from the process environment (`from_env`) or
//! from an arbitrary lookup function (`from_lookup`), which is what the tests
//! use.
//!
//! | Variable | Default | Section |
//! |----------|---------|---------|
//! | `TASKBRIDGE_BROKER_URL` | `memory://` | broker |
//! | `TASKBRIDGE_BROKER_MAX_RETRIES` | `0` | broker |
//! | `TASKBRIDGE_VISIBILITY_TIMEOUT_SECS` | `60` | broker |
//! | `TASKBRIDGE_MAX_REDELIVERIES` | unset (unlimited) | broker |
//! | `TASKBRIDGE_RESULT_TTL_SECS` | `3600` | broker |
//! | `TASKBRIDGE_WORKER_CONCURRENCY` | `4` | worker |
//! | `TASKBRIDGE_PREFETCH_COUNT` | `1` | worker |
//! | `TASKBRIDGE_MAX_JOBS_PER_WORKER` | `100` (`0` disables recycling) | worker |
//! | `TASKBRIDGE_SOFT_TIME_LIMIT_SECS` | `30` | worker |
//! | `TASKBRIDGE_ACKS_LATE` | `true` | worker |
//! | `TASKBRIDGE_CANCEL_ON_CONNECTION_LOSS` | `true` | worker |
//! | `TASKBRIDGE_REVOKE_CHECK_INTERVAL_MS` | `250` | worker |
//! | `TASKBRIDGE_TASK_TIMEOUT_SECS` | `30` | bridge |
//! | `TASKBRIDGE_CHECK_INTERVAL_MS` | `500` | bridge |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset or empty.
pub fn read<T, L>(lookup: &L, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    L: Fn(&str) -> Option<String>,
{
    Ok(read_optional(lookup, key)?.unwrap_or(default))
}

/// Read and parse an optional variable.
pub fn read_optional<T, L>(lookup: &L, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, raw.clone(), e.to_string())),
        _ => Ok(None),
    }
}

/// Read a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub fn read_bool<L>(lookup: &L, key: &str, default: bool) -> Result<bool, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
    }
}

fn read_secs<L>(lookup: &L, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    read(lookup, key, default).map(Duration::from_secs)
}

fn read_millis<L>(lookup: &L, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    read(lookup, key, default).map(Duration::from_millis)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Broker (queue transport and result backend) settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// `memory://` for the in-process broker, `redis://...` for Redis.
    pub url: String,
    /// Connection retries on submit. `0` fails fast.
    pub max_retries: u32,
    /// How long a claimed job may stay unacknowledged before redelivery.
    pub visibility_timeout: Duration,
    /// Redeliveries allowed before a job is dead-lettered. `None` = unlimited.
    pub max_redeliveries: Option<u32>,
    /// How long result records are kept.
    pub result_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            max_retries: 0,
            visibility_timeout: Duration::from_secs(60),
            max_redeliveries: None,
            result_ttl: Duration::from_secs(3600),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            url: read(&lookup, "TASKBRIDGE_BROKER_URL", defaults.url)?,
            max_retries: read(&lookup, "TASKBRIDGE_BROKER_MAX_RETRIES", defaults.max_retries)?,
            visibility_timeout: read_secs(&lookup, "TASKBRIDGE_VISIBILITY_TIMEOUT_SECS", 60)?,
            max_redeliveries: read_optional(&lookup, "TASKBRIDGE_MAX_REDELIVERIES")?,
            result_ttl: read_secs(&lookup, "TASKBRIDGE_RESULT_TTL_SECS", 3600)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn is_in_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }

    pub fn is_redis(&self) -> bool {
        self.url.starts_with("redis://") || self.url.starts_with("rediss://")
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = Some(max);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_in_memory() && !self.is_redis() {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_BROKER_URL",
                self.url.clone(),
                "expected memory:// or redis://",
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_VISIBILITY_TIMEOUT_SECS",
                "0",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of worker slots.
    pub concurrency: usize,
    /// Jobs claimed ahead per slot. Only `1` is supported.
    pub prefetch_count: u32,
    /// Jobs a slot executes before it is replaced. `None` disables recycling.
    pub max_jobs_per_worker: Option<u32>,
    /// Cooperative cancellation deadline for a single job.
    pub soft_time_limit: Duration,
    /// Acknowledge after the terminal result is written.
    pub acks_late: bool,
    /// Cancel running jobs when the broker connection is lost.
    pub cancel_on_connection_loss: bool,
    /// How often a running job checks for revocation.
    pub revoke_check_interval: Duration,
    /// Backoff after a failed claim.
    pub claim_retry_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            prefetch_count: 1,
            max_jobs_per_worker: Some(100),
            soft_time_limit: Duration::from_secs(30),
            acks_late: true,
            cancel_on_connection_loss: true,
            revoke_check_interval: Duration::from_millis(250),
            claim_retry_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_jobs: u32 = read(&lookup, "TASKBRIDGE_MAX_JOBS_PER_WORKER", 100)?;

        let config = Self {
            concurrency: read(&lookup, "TASKBRIDGE_WORKER_CONCURRENCY", defaults.concurrency)?,
            prefetch_count: read(&lookup, "TASKBRIDGE_PREFETCH_COUNT", defaults.prefetch_count)?,
            max_jobs_per_worker: (max_jobs > 0).then_some(max_jobs),
            soft_time_limit: read_secs(&lookup, "TASKBRIDGE_SOFT_TIME_LIMIT_SECS", 30)?,
            acks_late: read_bool(&lookup, "TASKBRIDGE_ACKS_LATE", defaults.acks_late)?,
            cancel_on_connection_loss: read_bool(
                &lookup,
                "TASKBRIDGE_CANCEL_ON_CONNECTION_LOSS",
                defaults.cancel_on_connection_loss,
            )?,
            revoke_check_interval: read_millis(&lookup, "TASKBRIDGE_REVOKE_CHECK_INTERVAL_MS", 250)?,
            claim_retry_interval: defaults.claim_retry_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_jobs_per_worker(mut self, max: Option<u32>) -> Self {
        self.max_jobs_per_worker = max;
        self
    }

    pub fn with_soft_time_limit(mut self, limit: Duration) -> Self {
        self.soft_time_limit = limit;
        self
    }

    pub fn with_revoke_check_interval(mut self, interval: Duration) -> Self {
        self.revoke_check_interval = interval;
        self
    }

    pub fn with_claim_retry_interval(mut self, interval: Duration) -> Self {
        self.claim_retry_interval = interval;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_WORKER_CONCURRENCY",
                "0",
                "must be at least 1",
            ));
        }
        if self.prefetch_count != 1 {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_PREFETCH_COUNT",
                self.prefetch_count.to_string(),
                "only a prefetch of 1 is supported",
            ));
        }
        if self.revoke_check_interval.is_zero() {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_REVOKE_CHECK_INTERVAL_MS",
                "0",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Dispatch bridge settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Deadline for a job to reach a terminal state, measured from submission.
    pub task_timeout: Duration,
    /// Pause between result polls.
    pub check_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            check_interval: Duration::from_millis(500),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let config = Self {
            task_timeout: read_secs(&lookup, "TASKBRIDGE_TASK_TIMEOUT_SECS", 30)?,
            check_interval: read_millis(&lookup, "TASKBRIDGE_CHECK_INTERVAL_MS", 500)?,
        };
        if config.check_interval.is_zero() {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_CHECK_INTERVAL_MS",
                "0",
                "must be greater than zero",
            ));
        }
        Ok(config)
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let empty = lookup(&[]);
        assert_eq!(BrokerConfig::from_lookup(&empty).unwrap(), BrokerConfig::default());
        assert_eq!(WorkerConfig::from_lookup(&empty).unwrap(), WorkerConfig::default());
        assert_eq!(BridgeConfig::from_lookup(&empty).unwrap(), BridgeConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let vars = lookup(&[
            ("TASKBRIDGE_BROKER_URL", "redis://cache:6379/0"),
            ("TASKBRIDGE_MAX_REDELIVERIES", "3"),
            ("TASKBRIDGE_WORKER_CONCURRENCY", "8"),
            ("TASKBRIDGE_MAX_JOBS_PER_WORKER", "0"),
            ("TASKBRIDGE_ACKS_LATE", "no"),
            ("TASKBRIDGE_TASK_TIMEOUT_SECS", "5"),
            ("TASKBRIDGE_CHECK_INTERVAL_MS", "50"),
        ]);

        let broker = BrokerConfig::from_lookup(&vars).unwrap();
        assert!(broker.is_redis());
        assert_eq!(broker.max_redeliveries, Some(3));

        let worker = WorkerConfig::from_lookup(&vars).unwrap();
        assert_eq!(worker.concurrency, 8);
        assert_eq!(worker.max_jobs_per_worker, None);
        assert!(!worker.acks_late);

        let bridge = BridgeConfig::from_lookup(&vars).unwrap();
        assert_eq!(bridge.task_timeout, Duration::from_secs(5));
        assert_eq!(bridge.check_interval, Duration::from_millis(50));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[("TASKBRIDGE_TASK_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        let ConfigError::Invalid { key, value, .. } = err;
        assert_eq!(key, "TASKBRIDGE_TASK_TIMEOUT_SECS");
        assert_eq!(value, "soon");
    }

    #[test]
    fn prefetch_other_than_one_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("TASKBRIDGE_PREFETCH_COUNT", "4")]));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_broker_scheme_is_rejected() {
        let err = BrokerConfig::from_lookup(lookup(&[("TASKBRIDGE_BROKER_URL", "amqp://rabbit")]));
        assert!(err.is_err());
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("TASKBRIDGE_ACKS_LATE", "maybe")]));
        assert!(err.is_err());
    }
}
