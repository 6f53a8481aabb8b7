use std::sync::Arc;

use taskbridge_infra::config::WorkerConfig;
use taskbridge_infra::jobs::{DelayEchoHandler, HandlerRegistry, PROCESS_TASK, WorkerPool, WorkerPoolHandle};
use taskbridge_infra::{BridgeConfig, Broker, DispatchBridge};
use taskbridge_queue::{JobQueue, ResultStore};

pub type SharedBridge = DispatchBridge<Arc<dyn JobQueue>, Arc<dyn ResultStore>>;

/// Everything the HTTP handlers need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub bridge: SharedBridge,
}

impl AppServices {
    pub fn new(broker: &Broker, bridge: BridgeConfig) -> Self {
        Self {
            bridge: DispatchBridge::new(
                Arc::clone(&broker.queue),
                Arc::clone(&broker.results),
                bridge,
            ),
        }
    }
}

/// Handlers every worker process registers.
pub fn default_registry() -> HandlerRegistry {
    HandlerRegistry::new().with(PROCESS_TASK, DelayEchoHandler)
}

/// Spawn a worker pool on `broker` running the default handlers.
pub fn spawn_workers(broker: &Broker, config: WorkerConfig, name: &str) -> WorkerPoolHandle {
    WorkerPool::new(
        Arc::clone(&broker.queue),
        Arc::clone(&broker.results),
        default_registry,
        config,
    )
    .with_name(name)
    .spawn()
}
