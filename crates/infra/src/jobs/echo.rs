//! The `process` task: wait `delay` seconds, then report success.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::handler::{HandlerError, JobContext, JobHandler};

/// Task name served by [`DelayEchoHandler`].
pub const PROCESS_TASK: &str = "process";

/// Value returned by a successful `process` job.
pub const PROCESS_RESULT: &str = "request processed successfully";

/// Parameters of the `process` task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessParams {
    /// Seconds to wait before completing.
    #[serde(default)]
    pub delay: i64,
}

impl ProcessParams {
    pub fn new(delay: i64) -> Self {
        Self { delay }
    }

    pub fn duration(&self) -> Result<Duration, HandlerError> {
        u64::try_from(self.delay)
            .map(Duration::from_secs)
            .map_err(|_| HandlerError::InvalidPayload(format!("delay must be >= 0, got {}", self.delay)))
    }
}

/// Sleeps for the requested delay, giving up early if cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayEchoHandler;

#[async_trait]
impl JobHandler for DelayEchoHandler {
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Value, HandlerError> {
        let params: ProcessParams = serde_json::from_value(payload)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        let delay = params.duration()?;

        debug!(job_id = %ctx.job_id(), delay_secs = delay.as_secs(), "processing");

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(Value::String(PROCESS_RESULT.to_string())),
            _ = ctx.cancelled() => Err(HandlerError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::CancelReason;
    use serde_json::json;
    use taskbridge_core::JobId;

    #[tokio::test(start_paused = true)]
    async fn completes_after_delay() {
        let ctx = JobContext::new(JobId::new(), 1);
        let started = tokio::time::Instant::now();

        let out = DelayEchoHandler.handle(ctx, json!({"delay": 2})).await.unwrap();

        assert_eq!(out, json!(PROCESS_RESULT));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let ctx = JobContext::new(JobId::new(), 1);
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel(CancelReason::Revoked);
        });

        let err = DelayEchoHandler
            .handle(ctx, json!({"delay": 60}))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::Cancelled);
    }

    #[tokio::test]
    async fn missing_delay_means_zero() {
        let out = DelayEchoHandler
            .handle(JobContext::new(JobId::new(), 1), json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!(PROCESS_RESULT));
    }

    #[tokio::test]
    async fn negative_delay_is_invalid() {
        let err = DelayEchoHandler
            .handle(JobContext::new(JobId::new(), 1), json!({"delay": -1}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}
