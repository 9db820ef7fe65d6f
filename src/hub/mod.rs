//! Live fan-out hub
//!
//! Mirrors every payload arriving from the message bus to every connected
//! live subscriber. The subscriber set is owned by a single hub task,
//! reachable only through three bounded channels (register, unregister,
//! broadcast), so no lock is shared with the outside.
//!
//! Delivery is at-most-once per subscriber: each write is one non-blocking
//! send, and any failure (full buffer or gone receiver) evicts that
//! subscriber on the spot. Slow dashboards get dropped, producers never
//! get backpressured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::MessageBus;

/// Pending register/unregister requests.
const CONTROL_BUFFER: usize = 32;

/// Pending broadcasts before the bus forwarder starts dropping.
const BROADCAST_BUFFER: usize = 256;

/// Per-subscriber outbound buffer; overflowing it is an eviction.
const SUBSCRIBER_BUFFER: usize = 64;

pub type SubscriberId = u64;

struct Registration {
    id: SubscriberId,
    tx: mpsc::Sender<String>,
}

/// The hub task. Owns the subscriber set exclusively.
struct Hub {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<SubscriberId>,
    broadcast_rx: mpsc::Receiver<String>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<String>>,
}

impl Hub {
    #[instrument(skip_all)]
    async fn run(mut self, cancel: CancellationToken) {
        debug!("hub started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(registration) = self.register_rx.recv() => {
                    info!("live subscriber {} registered", registration.id);
                    self.subscribers.insert(registration.id, registration.tx);
                }

                Some(id) = self.unregister_rx.recv() => {
                    if self.subscribers.remove(&id).is_some() {
                        info!("live subscriber {id} unregistered");
                    }
                }

                Some(message) = self.broadcast_rx.recv() => {
                    self.broadcast(message);
                }

                else => break,
            }
        }

        // Dropping the senders closes every subscriber stream.
        self.subscribers.clear();
        debug!("hub stopped, all subscribers closed");
    }

    /// One non-blocking send per subscriber. A failed send evicts the
    /// subscriber before the next broadcast can reach it.
    fn broadcast(&mut self, message: String) {
        let mut dead = Vec::new();

        for (id, tx) in &self.subscribers {
            if let Err(e) = tx.try_send(message.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("live subscriber {id} is too slow, evicting");
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        debug!("live subscriber {id} is gone, evicting");
                    }
                }
                dead.push(*id);
            }
        }

        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<SubscriberId>,
    broadcast_tx: mpsc::Sender<String>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Spawn the hub task. Cancelling the token closes all subscribers
    /// and stops the task.
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);

        let hub = Hub {
            register_rx,
            unregister_rx,
            broadcast_rx,
            subscribers: HashMap::new(),
        };

        tokio::spawn(hub.run(cancel));

        Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new subscriber and return its message stream.
    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let _ = self.register_tx.send(Registration { id, tx }).await;
        (id, rx)
    }

    pub async fn unregister(&self, id: SubscriberId) {
        let _ = self.unregister_tx.send(id).await;
    }

    /// Queue one message for fan-out. Never blocks: a full hub drops the
    /// message with a log.
    pub fn broadcast(&self, message: String) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.broadcast_tx.try_send(message) {
            warn!("hub broadcast queue is full, dropping message");
        }
    }
}

/// Feed the hub from the message bus: subscribe to the topic and forward
/// every payload byte-for-byte until cancelled.
#[instrument(skip(bus, hub, cancel))]
pub async fn forward_bus(
    bus: Arc<dyn MessageBus>,
    topic: &str,
    hub: HubHandle,
    cancel: CancellationToken,
) {
    let mut feed = match bus.subscribe(topic).await {
        Ok(feed) => feed,
        Err(e) => {
            warn!("cannot subscribe to {topic}: {e}, live feed disabled");
            return;
        }
    };

    debug!("bus forwarder started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            payload = feed.recv() => match payload {
                Some(payload) => match String::from_utf8(payload) {
                    Ok(text) => hub.broadcast(text),
                    Err(e) => warn!("dropping non-utf8 payload from {topic}: {e}"),
                },
                None => {
                    warn!("bus subscription to {topic} ended");
                    break;
                }
            },
        }
    }

    debug!("bus forwarder stopped");
}

/// Attach one WebSocket to the hub: a writer task pumps the subscriber
/// stream into the socket, a reader task exists only to detect disconnect.
pub async fn serve_socket(socket: WebSocket, hub: HubHandle) {
    let (id, mut messages) = hub.subscribe().await;
    info!("websocket client connected as subscriber {id}");

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = messages.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                debug!("websocket send failed, client disconnected");
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(id).await;
    info!("websocket client {id} disconnected");
}
