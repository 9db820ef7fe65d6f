//! Postgres catalog store
//!
//! Both processes (control plane and worker) share one database, so the
//! store is the only cross-process source of truth. The pool is bounded
//! and long-lived; boot-time connection failures are retried with backoff
//! because the database regularly comes up after the services in dev
//! compose files.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::{validate_monitor_input, CatalogStore, HISTORY_LIMIT};
use crate::types::{HostSample, Monitor, Observation};

/// Connection attempts before giving up at boot.
const CONNECT_ATTEMPTS: u32 = 10;

/// Backoff ceiling between connection attempts.
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Postgres-backed catalog store.
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Connect, retrying with exponential backoff (capped at 30 s), then
    /// run migrations. Exhausting the attempts is fatal for the caller.
    #[instrument(skip_all)]
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .max_lifetime(Duration::from_secs(60 * 60))
            .idle_timeout(Duration::from_secs(30 * 60));

        let mut backoff = Duration::from_secs(1);
        let mut attempt = 0;

        let pool = loop {
            attempt += 1;
            match options.clone().connect(database_url).await {
                Ok(pool) => break pool,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!("store connect attempt {attempt} failed: {e}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "gave up after {attempt} attempts: {e}"
                    )));
                }
            }
        };

        info!("store connection pool created");

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self { pool })
    }

    fn monitor_from_row(row: &PgRow) -> Monitor {
        Monitor {
            id: row.get("id"),
            url: row.get("url"),
            interval_seconds: row.get::<i32, _>("interval_seconds") as u32,
            is_active: row.get("is_active"),
            last_checked_at: row.get::<Option<DateTime<Utc>>, _>("last_checked_at"),
        }
    }

    fn observation_from_row(row: &PgRow) -> Observation {
        Observation {
            id: row.get("id"),
            monitor_id: row.get("monitor_id"),
            created_at: row.get("created_at"),
            status_code: row.get("status_code"),
            status: row.get("status"),
            latency_ms: row.get::<i32, _>("latency") as u32,
            timing_dns: row.get::<i32, _>("timing_dns") as u32,
            timing_tcp: row.get::<i32, _>("timing_tcp") as u32,
            timing_tls: row.get::<i32, _>("timing_tls") as u32,
            timing_ttfb: row.get::<i32, _>("timing_ttfb") as u32,
            timing_download: row.get::<i32, _>("timing_download") as u32,
        }
    }

    fn sample_from_row(row: &PgRow) -> HostSample {
        HostSample {
            id: row.get("id"),
            created_at: row.get("created_at"),
            cpu_percent: row.get("cpu_percent"),
            memory_percent: row.get("memory_percent"),
            disk_percent: row.get("disk_percent"),
            net_kb_per_sec: row.get("net_kb_s"),
            threads_total: row.get::<i32, _>("threads_total") as u32,
            threads_running: row.get::<i32, _>("threads_running") as u32,
            threads_sleeping: row.get::<i32, _>("threads_sleeping") as u32,
            threads_zombie: row.get::<i32, _>("threads_zombie") as u32,
        }
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    #[instrument(skip(self))]
    async fn create_monitor(&self, url: &str, interval_seconds: u32) -> StoreResult<Monitor> {
        validate_monitor_input(url, interval_seconds)?;

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO monitors (id, url, interval_seconds, is_active)
            VALUES ($1, $2, $3, TRUE)
            "#,
        )
        .bind(id)
        .bind(url)
        .bind(interval_seconds as i32)
        .execute(&self.pool)
        .await?;

        debug!("created monitor {id} for {url}");

        Ok(Monitor {
            id,
            url: url.to_string(),
            interval_seconds,
            is_active: true,
            last_checked_at: None,
        })
    }

    async fn list_monitors(&self) -> StoreResult<Vec<Monitor>> {
        let rows = sqlx::query(
            "SELECT id, url, interval_seconds, is_active, last_checked_at FROM monitors",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::monitor_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn delete_monitor(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM monitors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_due_monitors(&self) -> StoreResult<Vec<Monitor>> {
        // Dueness lives in SQL so every replica sees the same answer.
        let rows = sqlx::query(
            r#"
            SELECT id, url, interval_seconds, is_active, last_checked_at
            FROM monitors
            WHERE is_active
              AND (last_checked_at IS NULL
                   OR last_checked_at <= now() - make_interval(secs => interval_seconds))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::monitor_from_row).collect())
    }

    #[instrument(skip(self, observation), fields(monitor_id = %observation.monitor_id))]
    async fn append_observation(&self, observation: &Observation) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO monitor_results (
                id, monitor_id, created_at, status_code, status, latency,
                timing_dns, timing_tcp, timing_tls, timing_ttfb, timing_download
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(observation.id)
        .bind(observation.monitor_id)
        .bind(observation.created_at)
        .bind(observation.status_code)
        .bind(&observation.status)
        .bind(observation.latency_ms as i32)
        .bind(observation.timing_dns as i32)
        .bind(observation.timing_tcp as i32)
        .bind(observation.timing_tls as i32)
        .bind(observation.timing_ttfb as i32)
        .bind(observation.timing_download as i32)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE monitors SET last_checked_at = $2 WHERE id = $1")
            .bind(observation.monitor_id)
            .bind(observation.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_observations(&self, monitor_id: Uuid) -> StoreResult<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, monitor_id, created_at, status_code, status, latency,
                   timing_dns, timing_tcp, timing_tls, timing_ttfb, timing_download
            FROM monitor_results
            WHERE monitor_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(monitor_id)
        .bind(HISTORY_LIMIT as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::observation_from_row).collect())
    }

    #[instrument(skip(self, sample))]
    async fn append_host_sample(&self, sample: &HostSample) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_stats (
                id, created_at, cpu_percent, memory_percent, disk_percent, net_kb_s,
                threads_total, threads_running, threads_sleeping, threads_zombie
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(sample.id)
        .bind(sample.created_at)
        .bind(sample.cpu_percent)
        .bind(sample.memory_percent)
        .bind(sample.disk_percent)
        .bind(sample.net_kb_per_sec)
        .bind(sample.threads_total as i32)
        .bind(sample.threads_running as i32)
        .bind(sample.threads_sleeping as i32)
        .bind(sample.threads_zombie as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_host_history(&self) -> StoreResult<Vec<HostSample>> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, cpu_percent, memory_percent, disk_percent, net_kb_s,
                   threads_total, threads_running, threads_sleeping, threads_zombie
            FROM system_stats
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(HISTORY_LIMIT as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::sample_from_row).collect())
    }
}
