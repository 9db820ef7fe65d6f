//! End-to-end pipeline: scheduler -> queue -> executor -> store + bus

use std::sync::Arc;
use std::time::Duration;

use pulsar::bus::{MemoryBus, MessageBus};
use pulsar::queue::MemoryQueue;
use pulsar::store::{CatalogStore, MemoryCatalog};
use pulsar::types::STATUS_DOWN;
use pulsar::LIVE_TOPIC;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

fn pipeline_parts() -> (Arc<MemoryCatalog>, Arc<MemoryBus>, Arc<MemoryQueue>) {
    (
        Arc::new(MemoryCatalog::new()),
        Arc::new(MemoryBus::new()),
        Arc::new(MemoryQueue::new()),
    )
}

#[tokio::test]
async fn created_monitor_gets_probed_persisted_and_published() {
    let (store, bus, queue) = pipeline_parts();
    let addr = serve_http("HTTP/1.1 200 OK", b"hello").await;

    let monitor = store
        .create_monitor(&format!("http://{addr}/"), 1)
        .await
        .unwrap();
    let mut live = bus.subscribe(LIVE_TOPIC).await.unwrap();

    let cancel = CancellationToken::new();
    let (poller, consumer) = start_pipeline(
        store.clone(),
        bus.clone(),
        queue,
        Duration::from_millis(50),
        cancel.clone(),
    );

    let observed = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        let id = monitor.id;
        async move { !store.get_observations(id).await.unwrap().is_empty() }
    })
    .await;
    assert!(observed, "no observation arrived in time");

    let observations = store.get_observations(monitor.id).await.unwrap();
    let first = observations.last().unwrap();
    assert_eq!(first.status_code, 200);
    assert_eq!(first.status, "OK");
    assert!(first.latency_ms < 10_000);
    // Local IP target over plain http: those phases never happen.
    assert_eq!(first.timing_dns, 0);
    assert_eq!(first.timing_tls, 0);
    let phase_sum = first.timing_dns
        + first.timing_tcp
        + first.timing_tls
        + first.timing_ttfb
        + first.timing_download;
    assert!(phase_sum <= first.latency_ms + 5);

    // The same result went out on the live channel.
    let payload = live.recv().await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["type"], "monitor_update");
    assert_eq!(value["data"]["code"], 200);
    assert_eq!(value["data"]["monitor_id"], monitor.id.to_string());

    // The probe stamped the monitor.
    let listed = &store.list_monitors().await.unwrap()[0];
    assert!(listed.last_checked_at.is_some());

    cancel.cancel();
    poller.await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn unreachable_monitor_is_recorded_as_down() {
    let (store, bus, queue) = pipeline_parts();
    let addr = dead_addr().await;

    let monitor = store
        .create_monitor(&format!("http://{addr}/"), 1)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (poller, consumer) = start_pipeline(
        store.clone(),
        bus,
        queue,
        Duration::from_millis(50),
        cancel.clone(),
    );

    let observed = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        let id = monitor.id;
        async move { !store.get_observations(id).await.unwrap().is_empty() }
    })
    .await;
    assert!(observed, "no DOWN observation arrived in time");

    let observations = store.get_observations(monitor.id).await.unwrap();
    let first = observations.last().unwrap();
    assert_eq!(first.status, STATUS_DOWN);
    assert_eq!(first.status_code, 0);
    assert_eq!(first.timing_dns, 0);
    assert_eq!(first.timing_tcp, 0);
    assert_eq!(first.timing_tls, 0);
    assert_eq!(first.timing_ttfb, 0);
    assert_eq!(first.timing_download, 0);

    cancel.cancel();
    poller.await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn deleted_monitor_stops_producing_observations() {
    let (store, bus, queue) = pipeline_parts();
    let addr = serve_http("HTTP/1.1 200 OK", b"ok").await;

    let monitor = store
        .create_monitor(&format!("http://{addr}/"), 1)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (poller, consumer) = start_pipeline(
        store.clone(),
        bus,
        queue,
        Duration::from_millis(50),
        cancel.clone(),
    );

    let observed = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        let id = monitor.id;
        async move { !store.get_observations(id).await.unwrap().is_empty() }
    })
    .await;
    assert!(observed);

    store.delete_monitor(monitor.id).await.unwrap();
    assert!(store.list_monitors().await.unwrap().is_empty());

    // Whatever was already in flight lands shortly; after that, silence.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = store.get_observations(monitor.id).await.unwrap().len();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let later = store.get_observations(monitor.id).await.unwrap().len();
    assert_eq!(settled, later);

    cancel.cancel();
    poller.await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn probe_count_respects_the_interval() {
    let (store, bus, queue) = pipeline_parts();
    let addr = serve_http("HTTP/1.1 200 OK", b"ok").await;

    // Interval 1 s, scheduler ticking every 200 ms: the stamp written by
    // each probe keeps the monitor off the due list between intervals.
    let monitor = store
        .create_monitor(&format!("http://{addr}/"), 1)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (poller, consumer) = start_pipeline(
        store.clone(),
        bus,
        queue,
        Duration::from_millis(200),
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;
    cancel.cancel();
    poller.await.unwrap();
    consumer.await.unwrap();

    let count = store.get_observations(monitor.id).await.unwrap().len();
    assert!(
        (1..=3).contains(&count),
        "expected 1..=3 observations over ~1.2s at interval 1s, got {count}"
    );
}
