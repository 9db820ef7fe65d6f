//! Message bus: topic pub/sub over an external broker.
//!
//! The probe pipeline uses exactly one topic ([`crate::LIVE_TOPIC`]).
//! Delivery is at-most-once per subscription; a missed message is acceptable
//! because the next probe or host sample supersedes it. Publishing must not
//! hold up the producer's critical path: a transient failure is logged and
//! dropped by callers.

pub mod memory;
pub mod redis;

pub use memory::MemoryBus;
pub use redis::RedisBus;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Longest a `publish` may block its caller.
pub const PUBLISH_BUDGET: Duration = Duration::from_millis(50);

/// Buffered payloads per subscription before drops start.
pub const SUBSCRIBE_BUFFER: usize = 256;

pub type BusResult<T> = Result<T, BusError>;

/// Errors from the message bus. All of them are transient: callers log,
/// drop the payload and move on.
#[derive(Debug)]
pub enum BusError {
    Transient(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Transient(msg) => write!(f, "transient bus error: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}

impl From<::redis::RedisError> for BusError {
    fn from(err: ::redis::RedisError) -> Self {
        BusError::Transient(err.to_string())
    }
}

/// Topic pub/sub. Ordering is preserved per publisher, not across
/// publishers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one payload. Must return within [`PUBLISH_BUDGET`].
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Open a subscription. The receiver yields raw payload bytes; when the
    /// subscriber falls behind, payloads are dropped, never buffered
    /// unboundedly.
    async fn subscribe(&self, topic: &str) -> BusResult<mpsc::Receiver<Vec<u8>>>;
}
