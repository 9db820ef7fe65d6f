//! Control-plane endpoint tests against a real listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pulsar::api::{self, ApiState};
use pulsar::hub::HubHandle;
use pulsar::store::{CatalogStore, MemoryCatalog};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

async fn spawn_test_api() -> (SocketAddr, Arc<MemoryCatalog>, HubHandle, CancellationToken) {
    let store = Arc::new(MemoryCatalog::new());
    let cancel = CancellationToken::new();
    let hub = HubHandle::spawn(cancel.clone());

    let state = ApiState {
        store: store.clone(),
        hub: hub.clone(),
    };

    let addr = api::serve("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();

    (addr, store, hub, cancel)
}

#[tokio::test]
async fn monitor_crud_round_trip() {
    let (addr, _store, _hub, cancel) = spawn_test_api().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/v1");

    // Create
    let created: Value = client
        .post(format!("{base}/monitors"))
        .json(&serde_json::json!({ "url": "https://example.com", "interval_seconds": 30 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["url"], "https://example.com");
    assert_eq!(created["is_active"], true);
    let id = created["id"].as_str().unwrap().to_string();

    // List contains it
    let listed: Value = client
        .get(format!("{base}/monitors"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let monitors = listed["monitors"].as_array().unwrap();
    assert_eq!(monitors.len(), 1);
    assert_eq!(monitors[0]["id"], id.as_str());

    // Delete
    let deleted: Value = client
        .delete(format!("{base}/monitors/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["success"], true);

    let listed: Value = client
        .get(format!("{base}/monitors"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed["monitors"].as_array().unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn invalid_input_is_rejected_with_400() {
    let (addr, _store, _hub, cancel) = spawn_test_api().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/v1");

    let response = client
        .post(format!("{base}/monitors"))
        .json(&serde_json::json!({ "url": "", "interval_seconds": 30 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{base}/monitors"))
        .json(&serde_json::json!({ "url": "https://example.com", "interval_seconds": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .delete(format!("{base}/monitors/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    cancel.cancel();
}

#[tokio::test]
async fn monitor_stats_come_back_with_timings() {
    let (addr, store, _hub, cancel) = spawn_test_api().await;
    let client = reqwest::Client::new();

    let monitor = store
        .create_monitor("https://example.com", 30)
        .await
        .unwrap();
    store
        .append_observation(&pulsar::types::Observation {
            id: uuid::Uuid::new_v4(),
            monitor_id: monitor.id,
            created_at: chrono::Utc::now(),
            status_code: 200,
            status: "OK".to_string(),
            latency_ms: 120,
            timing_dns: 5,
            timing_tcp: 10,
            timing_tls: 40,
            timing_ttfb: 60,
            timing_download: 5,
        })
        .await
        .unwrap();

    let stats: Value = client
        .get(format!(
            "http://{addr}/api/v1/monitors/{}/stats",
            monitor.id
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let entries = stats["stats"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["status_code"], 200);
    assert_eq!(entries[0]["timing_tls"], 40);
    assert_eq!(entries[0]["latency_ms"], 120);

    cancel.cancel();
}

#[tokio::test]
async fn websocket_subscribers_share_every_broadcast() {
    let (addr, _store, hub, cancel) = spawn_test_api().await;
    let url = format!("ws://{addr}/ws");

    let (first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (_, mut first_read) = first.split();
    let (mut second_write, mut second_read) = second.split();

    // Give both registrations time to land in the hub.
    tokio::time::sleep(Duration::from_millis(100)).await;

    hub.broadcast(r#"{"type":"system","data":{}}"#.to_string());

    let to_first = first_read.next().await.unwrap().unwrap();
    let to_second = second_read.next().await.unwrap().unwrap();
    assert_eq!(to_first, to_second);
    assert!(matches!(to_first, Message::Text(ref text) if text.contains("\"system\"")));

    // One client going away must not affect the other.
    second_write.send(Message::Close(None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    hub.broadcast(r#"{"type":"system","data":{"n":2}}"#.to_string());
    let follow_up = first_read.next().await.unwrap().unwrap();
    assert!(matches!(follow_up, Message::Text(ref text) if text.contains("\"n\":2")));

    cancel.cancel();
}
