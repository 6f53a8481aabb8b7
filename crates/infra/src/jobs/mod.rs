//! Job execution: handlers, single worker slots and the worker pool.
//!
//! ## Design
//!
//! - Handlers are registered by task name and receive a cancellation context
//! - A worker writes `Started`, runs the handler, writes exactly one terminal
//!   record and only then acknowledges the delivery (late ack)
//! - Failures are data: handler errors and panics become `Failed` records
//! - Slots retire after a fixed number of jobs and are rebuilt from scratch
//!
//! ## Components
//!
//! - `JobHandler` / `HandlerRegistry`: task routing
//! - `Worker`: executes one delivery at a time
//! - `WorkerPool`: N slots with recycling, graceful shutdown and stats
//! - `DelayEchoHandler`: the built-in `process` task

pub mod echo;
pub mod handler;
pub mod pool;
pub mod worker;

pub use echo::{DelayEchoHandler, PROCESS_RESULT, PROCESS_TASK, ProcessParams};
pub use handler::{
    CancelReason, HandlerError, HandlerFn, HandlerRegistry, JobContext, JobHandler, handler_fn,
};
pub use pool::{PoolStats, RegistryFactory, WorkerPool, WorkerPoolHandle};
pub use worker::{Execution, Worker};
