//! Streamed system stats
//!
//! A server-sent-events stream that first delivers the recent host-sample
//! history plus host identity, then a summary of the latest sample on the
//! sampler cadence. The worker is the single sampler; this endpoint only
//! reads what it stored. Client disconnects simply drop the stream.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use sysinfo::System;
use tracing::warn;

use super::ApiState;
use crate::store::CatalogStore as _;
use crate::types::{HostSample, THREAD_ALARM_THRESHOLD};
use crate::worker::sampler::SAMPLE_PERIOD;

enum StreamPhase {
    Initial,
    Ticking(tokio::time::Interval),
}

/// GET /api/v1/system/stats
pub async fn system_stats_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let store = state.store.clone();

    let stream = stream::unfold(StreamPhase::Initial, move |phase| {
        let store = store.clone();
        async move {
            let (payload, next) = match phase {
                StreamPhase::Initial => {
                    let history = match store.get_host_history().await {
                        Ok(history) => history,
                        Err(e) => {
                            warn!("failed to load host history: {e}");
                            Vec::new()
                        }
                    };

                    let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
                    // Swallow the interval's immediate first fire; the next
                    // summary goes out one full period after the snapshot.
                    ticker.tick().await;

                    (initial_payload(&history), StreamPhase::Ticking(ticker))
                }
                StreamPhase::Ticking(mut ticker) => {
                    ticker.tick().await;

                    let latest = match store.get_host_history().await {
                        Ok(history) => history.into_iter().next(),
                        Err(e) => {
                            warn!("failed to load latest host sample: {e}");
                            None
                        }
                    };

                    (summary_payload(latest.as_ref()), StreamPhase::Ticking(ticker))
                }
            };

            let event = Event::default()
                .json_data(&payload)
                .unwrap_or_else(|_| Event::default());
            Some((Ok(event), next))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// First message: per-resource history (oldest first) plus host identity.
fn initial_payload(history: &[HostSample]) -> Value {
    let mut cpu = Vec::with_capacity(history.len());
    let mut memory = Vec::with_capacity(history.len());
    let mut disk = Vec::with_capacity(history.len());
    let mut network = Vec::with_capacity(history.len());
    let mut threads = Vec::with_capacity(history.len());

    for sample in history.iter().rev() {
        cpu.push(sample.cpu_percent);
        memory.push(sample.memory_percent);
        disk.push(sample.disk_percent);
        network.push(sample.net_kb_per_sec);
        threads.push(json!({
            "running": sample.threads_running,
            "sleeping": sample.threads_sleeping,
            "zombie": sample.threads_zombie,
            "time": sample.created_at.format("%H:%M:%S").to_string(),
        }));
    }

    json!({
        "cpu": { "history": cpu },
        "memory": { "history": memory },
        "disk": { "history": disk },
        "network": { "history": network },
        "threads": { "history": threads },
        "info": {
            "hostname": System::host_name(),
            "os": std::env::consts::OS,
            "platform": System::name(),
            "platform_version": System::os_version(),
            "uptime_seconds": System::uptime(),
        },
    })
}

/// Periodic message: the latest sample as gauges with warning flags.
fn summary_payload(latest: Option<&HostSample>) -> Value {
    let Some(sample) = latest else {
        return json!({
            "cpu": gauge(0.0, 100.0, 0.0, "%", false),
            "memory": gauge(0.0, 100.0, 0.0, "%", false),
            "disk": gauge(0.0, 100.0, 0.0, "%", false),
            "network": gauge(0.0, 0.0, 0.0, "KB/s", false),
            "threads": { "total": 0, "running": 0, "sleeping": 0, "zombie": 0, "is_warning": false },
        });
    };

    json!({
        "cpu": gauge(
            sample.cpu_percent,
            100.0,
            sample.cpu_percent,
            "%",
            sample.cpu_percent > 80.0,
        ),
        "memory": gauge(
            sample.memory_percent,
            100.0,
            sample.memory_percent,
            "%",
            sample.memory_percent > 90.0,
        ),
        "disk": gauge(
            sample.disk_percent,
            100.0,
            sample.disk_percent,
            "%",
            sample.disk_percent > 95.0,
        ),
        "network": gauge(sample.net_kb_per_sec, 0.0, 0.0, "KB/s", false),
        "threads": {
            "total": sample.threads_total,
            "running": sample.threads_running,
            "sleeping": sample.threads_sleeping,
            "zombie": sample.threads_zombie,
            "is_warning": sample.threads_total > THREAD_ALARM_THRESHOLD,
        },
    })
}

fn gauge(used: f64, total: f64, percent: f64, unit: &str, is_warning: bool) -> Value {
    json!({
        "used": used,
        "total": total,
        "percent": percent,
        "unit": unit,
        "is_warning": is_warning,
    })
}
