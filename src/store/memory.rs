//! In-memory catalog store
//!
//! Same semantics as the Postgres store, no persistence. Used by the test
//! suite and for running a single process without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::{validate_monitor_input, CatalogStore, HISTORY_LIMIT};
use crate::types::{HostSample, Monitor, Observation};

#[derive(Default)]
struct Inner {
    monitors: HashMap<Uuid, Monitor>,
    observations: Vec<Observation>,
    samples: Vec<HostSample>,
}

/// In-memory catalog store with interior mutability.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create_monitor(&self, url: &str, interval_seconds: u32) -> StoreResult<Monitor> {
        validate_monitor_input(url, interval_seconds)?;

        let monitor = Monitor {
            id: Uuid::new_v4(),
            url: url.to_string(),
            interval_seconds,
            is_active: true,
            last_checked_at: None,
        };

        self.lock()?.monitors.insert(monitor.id, monitor.clone());
        Ok(monitor)
    }

    async fn list_monitors(&self) -> StoreResult<Vec<Monitor>> {
        Ok(self.lock()?.monitors.values().cloned().collect())
    }

    async fn delete_monitor(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.monitors.remove(&id);
        inner.observations.retain(|o| o.monitor_id != id);
        Ok(())
    }

    async fn get_due_monitors(&self) -> StoreResult<Vec<Monitor>> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .monitors
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect())
    }

    async fn append_observation(&self, observation: &Observation) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(monitor) = inner.monitors.get_mut(&observation.monitor_id) {
            monitor.last_checked_at = Some(observation.created_at);
        }
        inner.observations.push(observation.clone());
        Ok(())
    }

    async fn get_observations(&self, monitor_id: Uuid) -> StoreResult<Vec<Observation>> {
        let inner = self.lock()?;
        let mut observations: Vec<Observation> = inner
            .observations
            .iter()
            .filter(|o| o.monitor_id == monitor_id)
            .cloned()
            .collect();
        observations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        observations.truncate(HISTORY_LIMIT);
        Ok(observations)
    }

    async fn append_host_sample(&self, sample: &HostSample) -> StoreResult<()> {
        self.lock()?.samples.push(sample.clone());
        Ok(())
    }

    async fn get_host_history(&self) -> StoreResult<Vec<HostSample>> {
        let inner = self.lock()?;
        let mut samples = inner.samples.clone();
        samples.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        samples.truncate(HISTORY_LIMIT);
        Ok(samples)
    }
}
