//! Dispatch-poll bridge.
//!
//! Turns "enqueue and forget" into a synchronous call: submit a job, poll the
//! result store every `check_interval` until the job is terminal or the
//! deadline passes, and revoke the job once on timeout.
//!
//! The deadline only governs how long the caller waits. A revoked job may
//! still finish later; its result is written but nobody reads it.

mod dispatch;
mod session;

pub use dispatch::{BridgeError, BridgeOutcome, DispatchBridge, PENDING_MESSAGE};
pub use session::{PollSession, PollStep};
