//! Core domain model shared by the scheduler, probe executor, sampler,
//! store and the live channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A monitored HTTP(S) endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub url: String,
    pub interval_seconds: u32,
    pub is_active: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Monitor {
    /// A monitor is due when it is active and was never probed, or its last
    /// probe is at least `interval_seconds` old.
    ///
    /// The store is the authority on dueness; this predicate is the
    /// in-memory mirror of the SQL condition.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match self.last_checked_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= i64::from(self.interval_seconds),
        }
    }
}

/// One recorded probe outcome with the per-phase timing breakdown.
///
/// Append-only: produced by the probe executor, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub created_at: DateTime<Utc>,

    /// HTTP status code, 0 when the transport failed.
    pub status_code: i32,

    /// HTTP reason phrase, `"DOWN"` when the transport failed.
    pub status: String,

    /// Total wall time of the transaction in whole milliseconds.
    pub latency_ms: u32,

    pub timing_dns: u32,
    pub timing_tcp: u32,
    pub timing_tls: u32,
    pub timing_ttfb: u32,
    pub timing_download: u32,
}

/// The sentinel status recorded when transport fails before any response.
pub const STATUS_DOWN: &str = "DOWN";

/// One host-level resource snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSample {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub net_kb_per_sec: f64,
    pub threads_total: u32,
    pub threads_running: u32,
    pub threads_sleeping: u32,
    pub threads_zombie: u32,
}

/// Ephemeral probe task envelope, created by the scheduler and consumed by
/// the executor. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTask {
    pub monitor_id: Uuid,
    pub url: String,
}

/// A message on the live channel, one UTF-8 JSON object per message.
///
/// Consumers dispatch on the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveMessage {
    MonitorUpdate(MonitorUpdate),
    System(SystemUpdate),
}

/// Payload of a `monitor_update` live message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorUpdate {
    pub monitor_id: Uuid,
    pub status: String,
    pub code: i32,
    pub latency: u32,
    pub timing: PhaseTiming,
}

/// The five-phase breakdown as it appears on the wire.
///
/// The TCP phase is called `connect` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub dns: u32,
    pub connect: u32,
    pub tls: u32,
    pub ttfb: u32,
    pub download: u32,
}

/// Payload of a `system` live message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemUpdate {
    pub cpu: CpuGauge,
    pub memory: SizedGauge,
    pub disk: SizedGauge,
    pub network: NetworkGauge,
    pub threads: ThreadGauge,
    /// Host uptime in seconds.
    pub uptime: u64,
    pub os: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuGauge {
    pub percent: f64,
}

/// A used/total gauge reported in GiB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizedGauge {
    pub percent: f64,
    pub used: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkGauge {
    /// Throughput in KB/s over the previous sampling window.
    pub used: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadGauge {
    pub total: u32,
    pub running: u32,
    pub sleeping: u32,
    pub zombie: u32,
    pub is_warning: bool,
}

/// Process-state histogram above this many entries flips the warning flag.
pub const THREAD_ALARM_THRESHOLD: u32 = 3000;

impl Observation {
    /// Build the live-channel payload for this observation.
    pub fn to_live_message(&self) -> LiveMessage {
        LiveMessage::MonitorUpdate(MonitorUpdate {
            monitor_id: self.monitor_id,
            status: self.status.clone(),
            code: self.status_code,
            latency: self.latency_ms,
            timing: PhaseTiming {
                dns: self.timing_dns,
                connect: self.timing_tcp,
                tls: self.timing_tls,
                ttfb: self.timing_ttfb,
                download: self.timing_download,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn monitor(interval: u32, last: Option<DateTime<Utc>>, active: bool) -> Monitor {
        Monitor {
            id: Uuid::new_v4(),
            url: "https://example.com".to_string(),
            interval_seconds: interval,
            is_active: active,
            last_checked_at: last,
        }
    }

    #[test]
    fn never_checked_monitor_is_due() {
        let now = Utc::now();
        assert!(monitor(60, None, true).is_due(now));
    }

    #[test]
    fn inactive_monitor_is_never_due() {
        let now = Utc::now();
        assert!(!monitor(60, None, false).is_due(now));
        assert!(!monitor(60, Some(now - Duration::hours(1)), false).is_due(now));
    }

    #[test]
    fn dueness_tracks_interval() {
        let now = Utc::now();
        assert!(!monitor(60, Some(now - Duration::seconds(30)), true).is_due(now));
        assert!(monitor(60, Some(now - Duration::seconds(60)), true).is_due(now));
        assert!(monitor(60, Some(now - Duration::seconds(90)), true).is_due(now));
    }

    #[test]
    fn live_message_wire_shape() {
        let msg = LiveMessage::MonitorUpdate(MonitorUpdate {
            monitor_id: Uuid::nil(),
            status: "200 OK".to_string(),
            code: 200,
            latency: 123,
            timing: PhaseTiming {
                dns: 10,
                connect: 20,
                tls: 30,
                ttfb: 40,
                download: 5,
            },
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "monitor_update");
        assert_eq!(value["data"]["code"], 200);
        assert_eq!(value["data"]["timing"]["connect"], 20);

        let roundtrip: LiveMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(roundtrip, LiveMessage::MonitorUpdate(_)));
    }

    #[test]
    fn system_message_carries_type_tag() {
        let msg = LiveMessage::System(SystemUpdate {
            cpu: CpuGauge { percent: 12.5 },
            memory: SizedGauge {
                percent: 40.0,
                used: 6.4,
                total: 16.0,
            },
            disk: SizedGauge {
                percent: 55.0,
                used: 110.0,
                total: 200.0,
            },
            network: NetworkGauge { used: 42.0 },
            threads: ThreadGauge {
                total: 400,
                running: 3,
                sleeping: 396,
                zombie: 1,
                is_warning: false,
            },
            uptime: 3600,
            os: "linux".to_string(),
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["data"]["threads"]["is_warning"], false);
    }
}
