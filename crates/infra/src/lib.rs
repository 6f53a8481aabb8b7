//! Infrastructure layer: workers, the dispatch-poll bridge, configuration and
//! broker adapters.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod jobs;


pub use bridge::{BridgeError, BridgeOutcome, DispatchBridge, PollSession, PollStep};
pub use broker::Broker;
pub use config::{BridgeConfig, BrokerConfig, ConfigError, WorkerConfig};
