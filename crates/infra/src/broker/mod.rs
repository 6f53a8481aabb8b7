//! Broker adapters.
//!
//! The in-memory queue and result store live in `taskbridge-queue`; this
//! module adds Redis-backed implementations (feature `redis`) and the wiring
//! that picks one from a [`BrokerConfig`].

#[cfg(feature = "redis")]
mod redis_results;
#[cfg(feature = "redis")]
mod redis_streams;

use std::sync::Arc;

use taskbridge_queue::{InMemoryJobQueue, InMemoryResultStore, JobQueue, ResultStore};

use crate::config::{BrokerConfig, ConfigError};

#[cfg(feature = "redis")]
pub use redis_results::RedisResultStore;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisQueueError, RedisStreamsJobQueue};

/// Queue and result store handles shared by the bridge and the workers.
#[derive(Clone)]
pub struct Broker {
    pub queue: Arc<dyn JobQueue>,
    pub results: Arc<dyn ResultStore>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(queue: Arc<dyn JobQueue>, results: Arc<dyn ResultStore>) -> Self {
        Self { queue, results }
    }

    /// In-process broker, only reachable from this process.
    pub fn in_memory(config: &BrokerConfig) -> Self {
        let queue = InMemoryJobQueue::new()
            .with_visibility_timeout(config.visibility_timeout)
            .with_max_redeliveries(config.max_redeliveries)
            .with_revocation_ttl(config.result_ttl);
        let results = InMemoryResultStore::new().with_ttl(config.result_ttl);
        Self::new(Arc::new(queue), Arc::new(results))
    }

    /// Build the broker described by `config`.
    ///
    /// Connecting is lazy: an unreachable Redis is reported by the first
    /// operation, not here.
    pub fn from_config(config: &BrokerConfig) -> Result<Self, ConfigError> {
        if config.is_in_memory() {
            return Ok(Self::in_memory(config));
        }
        Self::redis(config)
    }

    #[cfg(feature = "redis")]
    fn redis(config: &BrokerConfig) -> Result<Self, ConfigError> {
        let invalid = |e: RedisQueueError| {
            ConfigError::invalid("TASKBRIDGE_BROKER_URL", config.url.clone(), e.to_string())
        };
        let queue = RedisStreamsJobQueue::open(config).map_err(invalid)?;
        let results = RedisResultStore::open(config).map_err(invalid)?;
        Ok(Self::new(Arc::new(queue), Arc::new(results)))
    }

    #[cfg(not(feature = "redis"))]
    fn redis(config: &BrokerConfig) -> Result<Self, ConfigError> {
        Err(ConfigError::invalid(
            "TASKBRIDGE_BROKER_URL",
            config.url.clone(),
            "built without the `redis` feature",
        ))
    }
}
