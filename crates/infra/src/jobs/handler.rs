//! Job handlers and the per-execution context they receive.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskbridge_core::JobId;

/// Why a running job was asked to stop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The submitter gave up and revoked the job.
    Revoked,
    /// The job ran past the worker's soft time limit.
    SoftTimeLimit,
    /// The worker lost its broker connection.
    ConnectionLost,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Revoked => "revoked",
            CancelReason::SoftTimeLimit => "soft_time_limit",
            CancelReason::ConnectionLost => "connection_lost",
        }
    }
}

/// Context handed to a handler for one execution.
///
/// Cancellation is cooperative: handlers should `select!` on
/// [`JobContext::cancelled`] around long waits and return
/// [`HandlerError::Cancelled`]. A handler that ignores it simply runs to
/// completion.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    delivery_count: u32,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl JobContext {
    pub fn new(job_id: JobId, delivery_count: u32) -> Self {
        Self {
            job_id,
            delivery_count,
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Request cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The handler observed cancellation and stopped early.
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Executes one kind of job.
///
/// Handlers must be idempotent: with late acknowledgment the same job can be
/// delivered more than once.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, payload).await
    }
}

/// Task-name to handler lookup.
///
/// Patterns are matched exact first, then by category (`"reports.*"` matches
/// `"reports.daily"`, longest prefix wins), then the `"*"` wildcard.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task name or pattern.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler,
    {
        self.register(pattern, handler);
        self
    }

    pub fn get(&self, task: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(task) {
            return Some(Arc::clone(h));
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                task.strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(Arc::clone(h));
        }

        self.handlers.get("*").cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}
