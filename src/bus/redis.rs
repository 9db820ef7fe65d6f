//! Redis pub/sub message bus

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BusError, BusResult, MessageBus, PUBLISH_BUDGET, SUBSCRIBE_BUFFER};

/// Message bus backed by Redis pub/sub.
///
/// Publishing shares one multiplexed connection; every subscription gets a
/// dedicated pub/sub connection driven by a background task.
pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    pub async fn connect(addr: &str) -> BusResult<Self> {
        let client = redis::Client::open(format!("redis://{addr}/"))?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        info!("connected to message bus at {addr}");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let publish = async move {
            let _: () = conn.publish(topic, payload).await?;
            Ok::<_, BusError>(())
        };

        match tokio::time::timeout(PUBLISH_BUDGET, publish).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Transient(format!(
                "publish to {topic} exceeded {PUBLISH_BUDGET:?}"
            ))),
        }
    }

    async fn subscribe(&self, topic: &str) -> BusResult<mpsc::Receiver<Vec<u8>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload = msg.get_payload_bytes().to_vec();
                match tx.try_send(payload) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Never block the broker reader; the subscriber
                        // loses this message.
                        warn!("subscription to {topic} is full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("subscription to {topic} closed, stopping reader");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
