//! Catalog store: the durable side of the probe pipeline.
//!
//! The store owns the monitor catalog, the append-only observation log and
//! the append-only host-sample log. It is also the only authority on
//! "dueness" - the scheduler never computes it locally.
//!
//! ## Design
//!
//! - **Trait-based**: `CatalogStore` allows swapping implementations
//! - **Async**: all operations are async for compatibility with Tokio tasks
//! - **Postgres** for deployments (two processes share one database),
//!   **in-memory** for tests and local development

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{HostSample, Monitor, Observation};

/// Upper bound for history queries (observations and host samples).
pub const HISTORY_LIMIT: usize = 100;

/// Persistent mapping of monitors plus the two append-only logs.
///
/// Implementations must be `Send + Sync`; handles are shared across tasks.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Register a new monitor. New monitors are active and never checked.
    ///
    /// Fails with `InvalidArgument` for an empty url or a zero interval.
    async fn create_monitor(&self, url: &str, interval_seconds: u32) -> StoreResult<Monitor>;

    async fn list_monitors(&self) -> StoreResult<Vec<Monitor>>;

    /// Remove a monitor and its observations. Unknown ids are a no-op.
    async fn delete_monitor(&self, id: Uuid) -> StoreResult<()>;

    /// All active monitors whose last probe is at least one interval old
    /// (or that were never probed).
    async fn get_due_monitors(&self) -> StoreResult<Vec<Monitor>>;

    /// Append one probe outcome and stamp the monitor's `last_checked_at`
    /// with the observation's `created_at`, atomically.
    async fn append_observation(&self, observation: &Observation) -> StoreResult<()>;

    /// Most-recent-first observations for one monitor, bounded to
    /// [`HISTORY_LIMIT`].
    async fn get_observations(&self, monitor_id: Uuid) -> StoreResult<Vec<Observation>>;

    async fn append_host_sample(&self, sample: &HostSample) -> StoreResult<()>;

    /// Most-recent-first host samples, bounded to [`HISTORY_LIMIT`].
    async fn get_host_history(&self) -> StoreResult<Vec<HostSample>>;
}

/// Shared input validation for `create_monitor`.
pub(crate) fn validate_monitor_input(url: &str, interval_seconds: u32) -> StoreResult<()> {
    if url.trim().is_empty() {
        return Err(StoreError::InvalidArgument("url must not be empty".into()));
    }
    if interval_seconds == 0 {
        return Err(StoreError::InvalidArgument(
            "interval_seconds must be at least 1".into(),
        ));
    }
    Ok(())
}
