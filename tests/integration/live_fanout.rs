//! Bus -> hub -> subscribers fan-out

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pulsar::bus::MemoryBus;
use pulsar::hub::{forward_bus, HubHandle};
use pulsar::store::MemoryCatalog;
use pulsar::types::ProbeTask;
use pulsar::worker::{HostSampler, ProbeExecutor};
use pulsar::LIVE_TOPIC;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::helpers::*;

async fn fanout_setup() -> (
    Arc<MemoryCatalog>,
    Arc<MemoryBus>,
    HubHandle,
    CancellationToken,
) {
    let store = Arc::new(MemoryCatalog::new());
    let bus = Arc::new(MemoryBus::new());
    let cancel = CancellationToken::new();
    let hub = HubHandle::spawn(cancel.clone());

    tokio::spawn(forward_bus(
        bus.clone(),
        LIVE_TOPIC,
        hub.clone(),
        cancel.clone(),
    ));

    (store, bus, hub, cancel)
}

#[tokio::test]
async fn host_sample_reaches_every_subscriber_identically() {
    let (store, bus, hub, cancel) = fanout_setup().await;

    let (_, mut first) = hub.subscribe().await;
    let (_, mut second) = hub.subscribe().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut sampler = HostSampler::new(store, bus, PathBuf::from("/"));
    sampler.sample_once().await;

    let to_first = first.recv().await.unwrap();
    let to_second = second.recv().await.unwrap();

    // Byte-for-byte the same payload for everyone.
    assert_eq!(to_first, to_second);

    let value: serde_json::Value = serde_json::from_str(&to_first).unwrap();
    assert_eq!(value["type"], "system");
    assert!(value["data"]["cpu"]["percent"].is_number());

    cancel.cancel();
}

#[tokio::test]
async fn probe_result_reaches_every_subscriber() {
    let (store, bus, hub, cancel) = fanout_setup().await;
    let addr = serve_http("HTTP/1.1 200 OK", b"hi").await;

    let (_, mut first) = hub.subscribe().await;
    let (_, mut second) = hub.subscribe().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let executor = ProbeExecutor::new(store, bus);
    let task = ProbeTask {
        monitor_id: Uuid::new_v4(),
        url: format!("http://{addr}/"),
    };
    executor.probe(&task).await.unwrap();

    let to_first = first.recv().await.unwrap();
    let to_second = second.recv().await.unwrap();
    assert_eq!(to_first, to_second);

    let value: serde_json::Value = serde_json::from_str(&to_first).unwrap();
    assert_eq!(value["type"], "monitor_update");
    assert_eq!(value["data"]["code"], 200);

    cancel.cancel();
}
