//! Host-metrics sampler
//!
//! Samples host CPU, memory, disk, network throughput and a process-state
//! histogram on a fixed cadence, persists the sample and publishes the
//! `system` live message. Persist and publish are independent: one failing
//! never stops the other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sysinfo::{Disks, Networks, ProcessStatus, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::store::CatalogStore;
use crate::types::{
    CpuGauge, HostSample, LiveMessage, NetworkGauge, SizedGauge, SystemUpdate, ThreadGauge,
    THREAD_ALARM_THRESHOLD,
};
use crate::LIVE_TOPIC;

/// Sampler cadence.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(15);

/// Interface counters from the previous tick; network speed is the delta
/// against these over the wall-clock window.
struct NetCounters {
    received: u64,
    transmitted: u64,
    at: Instant,
}

pub struct HostSampler {
    store: Arc<dyn CatalogStore>,
    bus: Arc<dyn MessageBus>,
    root_fs: PathBuf,
    sys: System,
    prev_net: Option<NetCounters>,
    period: Duration,
}

impl HostSampler {
    pub fn new(store: Arc<dyn CatalogStore>, bus: Arc<dyn MessageBus>, root_fs: PathBuf) -> Self {
        Self {
            store,
            bus,
            root_fs,
            sys: System::new_all(),
            prev_net: None,
            period: SAMPLE_PERIOD,
        }
    }

    /// Override the cadence (tests).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run the sampling loop until cancelled.
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("host sampler started (every {:?})", self.period);

        let mut ticker = interval(self.period);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    self.sample_once().await;
                }
            }
        }

        debug!("host sampler stopped");
    }

    /// Collect one snapshot, persist it, publish it.
    pub async fn sample_once(&mut self) {
        let (sample, update) = self.collect();

        if let Err(e) = self.store.append_host_sample(&sample).await {
            error!("failed to persist host sample: {e}");
        }

        match serde_json::to_vec(&LiveMessage::System(update)) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(LIVE_TOPIC, payload).await {
                    warn!("failed to publish host sample: {e}");
                }
            }
            Err(e) => error!("failed to encode host sample: {e}"),
        }
    }

    /// One resource snapshot, as both the durable row and the live payload.
    fn collect(&mut self) -> (HostSample, SystemUpdate) {
        self.sys.refresh_all();

        // Delta since the previous refresh, i.e. an instantaneous window.
        let cpu_percent = f64::from(self.sys.global_cpu_usage()).clamp(0.0, 100.0);

        let memory_total = self.sys.total_memory();
        let memory_used = self.sys.used_memory();
        let memory_percent = percent(memory_used, memory_total);

        let (disk_used, disk_total) = disk_usage(&self.root_fs);
        let disk_percent = percent(disk_used, disk_total);

        let net_kb_per_sec = self.network_speed();

        let (threads_total, threads_running, threads_sleeping, threads_zombie) =
            process_histogram(&self.sys);

        let sample = HostSample {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            cpu_percent: round1(cpu_percent),
            memory_percent: round1(memory_percent),
            disk_percent: round1(disk_percent),
            net_kb_per_sec: round1(net_kb_per_sec),
            threads_total,
            threads_running,
            threads_sleeping,
            threads_zombie,
        };

        let update = SystemUpdate {
            cpu: CpuGauge {
                percent: sample.cpu_percent,
            },
            memory: SizedGauge {
                percent: sample.memory_percent,
                used: to_gb(memory_used),
                total: to_gb(memory_total),
            },
            disk: SizedGauge {
                percent: sample.disk_percent,
                used: to_gb(disk_used),
                total: to_gb(disk_total),
            },
            network: NetworkGauge {
                used: sample.net_kb_per_sec,
            },
            threads: ThreadGauge {
                total: threads_total,
                running: threads_running,
                sleeping: threads_sleeping,
                zombie: threads_zombie,
                is_warning: threads_total > THREAD_ALARM_THRESHOLD,
            },
            uptime: System::uptime(),
            os: System::name().unwrap_or_else(|| "unknown".to_string()),
        };

        (sample, update)
    }

    /// (delta received + delta transmitted) / wall-clock window, in KB/s.
    /// The first tick has no window and reports 0.
    fn network_speed(&mut self) -> f64 {
        let networks = Networks::new_with_refreshed_list();
        let mut received = 0u64;
        let mut transmitted = 0u64;
        for (_, data) in &networks {
            received += data.total_received();
            transmitted += data.total_transmitted();
        }
        let now = Instant::now();

        let speed = match &self.prev_net {
            Some(prev) => {
                let window = now.duration_since(prev.at).as_secs_f64();
                if window > 0.0 {
                    let delta = (received.saturating_sub(prev.received)
                        + transmitted.saturating_sub(prev.transmitted))
                        as f64;
                    delta / window / 1024.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        self.prev_net = Some(NetCounters {
            received,
            transmitted,
            at: now,
        });

        speed
    }
}

/// Walk the process table once and bucket by state:
/// `R` runs, `S`/`I` sleep, `Z`/`T`/`L` count as zombie, unreadable
/// states count toward the total only, everything else sleeps.
fn process_histogram(sys: &System) -> (u32, u32, u32, u32) {
    let mut running = 0u32;
    let mut sleeping = 0u32;
    let mut zombie = 0u32;

    let total = sys.processes().len() as u32;

    for process in sys.processes().values() {
        match process.status() {
            ProcessStatus::Run => running += 1,
            ProcessStatus::Sleep | ProcessStatus::Idle => sleeping += 1,
            ProcessStatus::Zombie
            | ProcessStatus::Stop
            | ProcessStatus::Tracing
            | ProcessStatus::LockBlocked => zombie += 1,
            ProcessStatus::Unknown(_) => {}
            _ => sleeping += 1,
        }
    }

    (total, running, sleeping, zombie)
}

/// Used/total space of the mounted filesystem covering `root_fs`
/// (longest mount-point match wins).
fn disk_usage(root_fs: &std::path::Path) -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(u64, u64, usize)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if root_fs.starts_with(mount) {
            let depth = mount.components().count();
            if best.map_or(true, |(_, _, d)| depth > d) {
                let total = disk.total_space();
                best = Some((total.saturating_sub(disk.available_space()), total, depth));
            }
        }
    }

    match best {
        Some((used, total, _)) => (used, total),
        None => (0, 0),
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

fn to_gb(bytes: u64) -> f64 {
    round1(bytes as f64 / 1024.0 / 1024.0 / 1024.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageBus};
    use crate::store::{CatalogStore, MemoryCatalog};

    fn sampler() -> (Arc<MemoryCatalog>, Arc<MemoryBus>, HostSampler) {
        let store = Arc::new(MemoryCatalog::new());
        let bus = Arc::new(MemoryBus::new());
        let sampler = HostSampler::new(store.clone(), bus.clone(), PathBuf::from("/"));
        (store, bus, sampler)
    }

    #[tokio::test]
    async fn histogram_and_percentages_hold_their_invariants() {
        let (_, _, mut sampler) = sampler();
        let (sample, update) = sampler.collect();

        assert!(
            sample.threads_running + sample.threads_sleeping + sample.threads_zombie
                <= sample.threads_total
        );
        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!((0.0..=100.0).contains(&sample.disk_percent));

        assert_eq!(update.threads.total, sample.threads_total);
        assert_eq!(
            update.threads.is_warning,
            sample.threads_total > THREAD_ALARM_THRESHOLD
        );
    }

    #[tokio::test]
    async fn first_tick_reports_zero_network_speed() {
        let (_, _, mut sampler) = sampler();

        let (first, _) = sampler.collect();
        assert_eq!(first.net_kb_per_sec, 0.0);

        let (second, _) = sampler.collect();
        assert!(second.net_kb_per_sec >= 0.0);
    }

    #[tokio::test]
    async fn sample_once_persists_and_publishes() {
        let (store, bus, mut sampler) = sampler();
        let mut live = bus.subscribe(LIVE_TOPIC).await.unwrap();

        sampler.sample_once().await;

        let history = store.get_host_history().await.unwrap();
        assert_eq!(history.len(), 1);

        let payload = live.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "system");
        assert!(value["data"]["uptime"].is_number());
        assert!(value["data"]["threads"]["total"].is_number());
    }

    #[test]
    fn rounding_is_one_decimal() {
        assert_eq!(round1(12.34), 12.3);
        assert_eq!(round1(12.35), 12.4);
        assert_eq!(to_gb(1024 * 1024 * 1024), 1.0);
    }

    #[test]
    fn percent_of_zero_total_is_zero() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(1, 2), 50.0);
    }
}
