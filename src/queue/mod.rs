//! Work queue: decouples the scheduler from the probe executors.
//!
//! Deliberately not a system of record. Tasks lost in a broker restart are
//! re-enqueued by the next scheduler tick; a full queue rejects new work
//! instead of growing without bound.
//!
//! A handler failure is retried with backoff up to the policy's cap, then
//! the task moves to a dead-letter sink.

pub mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::ProbeTask;

/// Probe workers per replica.
pub const WORKER_CONCURRENCY: usize = 10;

/// Pending tasks the queue will hold before rejecting enqueues.
pub const QUEUE_CAPACITY: usize = 1000;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug)]
pub enum QueueError {
    /// The queue is at capacity (transient; the monitor stays due and the
    /// next tick retries)
    Full,

    /// The broker is unreachable (transient)
    Unavailable(String),

    /// A payload could not be encoded or decoded
    Serialization(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue is full"),
            QueueError::Unavailable(msg) => write!(f, "queue unavailable: {}", msg),
            QueueError::Serialization(msg) => write!(f, "queue payload error: {}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<::redis::RedisError> for QueueError {
    fn from(err: ::redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Retry behaviour for failing handlers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (attempt numbering starts at 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Consumes one task. A transport-level probe failure is NOT a handler
/// failure; handlers return `Err` only for unrecoverable conditions worth
/// retrying from scratch.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: ProbeTask) -> anyhow::Result<()>;
}

/// Named task queue with bounded capacity and a worker pool.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Non-blocking enqueue; `QueueError::Full` on overflow.
    async fn enqueue(&self, task: &ProbeTask) -> QueueResult<()>;

    /// Run `workers` consumers until the token is cancelled. Each task is
    /// retried per `retry`, then dead-lettered.
    async fn consume(
        &self,
        handler: Arc<dyn TaskHandler>,
        workers: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> QueueResult<()>;
}

/// Drive one task through the handler with retries. Returns `Err` with the
/// final error when every attempt failed and the task should be
/// dead-lettered.
pub(crate) async fn run_with_retry(
    handler: &dyn TaskHandler,
    task: &ProbeTask,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match handler.handle(task.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retry.max_attempts && !cancel.is_cancelled() => {
                let delay = retry.delay(attempt);
                tracing::warn!(
                    "task for monitor {} failed (attempt {attempt}): {e:#}, retrying in {delay:?}",
                    task.monitor_id
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}
