//! Redis-backed work queue
//!
//! A plain list per queue name: `LPUSH` to enqueue, `BRPOP` to consume.
//! The blocking pop uses a short timeout so cancellation is observed
//! within a second. Exhausted tasks land on a `:dead` sibling list.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    run_with_retry, QueueError, QueueResult, RetryPolicy, TaskHandler, TaskQueue, QUEUE_CAPACITY,
};
use crate::types::ProbeTask;

/// How long one `BRPOP` blocks before re-checking for cancellation.
const POP_TIMEOUT_SECS: f64 = 1.0;

pub struct RedisQueue {
    client: redis::Client,
    conn: MultiplexedConnection,
    queue_key: String,
    dead_key: String,
    capacity: usize,
}

impl RedisQueue {
    /// Connect to the broker and bind to the named queue ("default" for
    /// this system).
    pub async fn connect(addr: &str, queue_name: &str) -> QueueResult<Self> {
        let client = redis::Client::open(format!("redis://{addr}/"))?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        info!("connected to work queue '{queue_name}' at {addr}");

        Ok(Self {
            client,
            conn,
            queue_key: format!("pulsar:queue:{queue_name}"),
            dead_key: format!("pulsar:queue:{queue_name}:dead"),
            capacity: QUEUE_CAPACITY,
        })
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, task: &ProbeTask) -> QueueResult<()> {
        let payload =
            serde_json::to_vec(task).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let pending: usize = conn.llen(&self.queue_key).await?;
        if pending >= self.capacity {
            return Err(QueueError::Full);
        }

        let _: () = conn.lpush(&self.queue_key, payload).await?;
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn TaskHandler>,
        workers: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> QueueResult<()> {
        let mut pool = JoinSet::new();

        for worker_id in 0..workers {
            let mut conn = self.client.get_multiplexed_tokio_connection().await?;
            let handler = handler.clone();
            let cancel = cancel.clone();
            let queue_key = self.queue_key.clone();
            let dead_key = self.dead_key.clone();

            pool.spawn(async move {
                debug!("worker {worker_id} started");

                while !cancel.is_cancelled() {
                    let popped: Option<(String, Vec<u8>)> = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = conn.brpop(&queue_key, POP_TIMEOUT_SECS) => match result {
                            Ok(popped) => popped,
                            Err(e) => {
                                warn!("worker {worker_id} pop failed: {e}");
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                                continue;
                            }
                        },
                    };

                    let Some((_, payload)) = popped else {
                        continue;
                    };

                    let task: ProbeTask = match serde_json::from_slice(&payload) {
                        Ok(task) => task,
                        Err(e) => {
                            // Undecodable payloads cannot be retried.
                            error!("worker {worker_id} got malformed payload: {e}");
                            let _: Result<(), _> = conn.lpush(&dead_key, payload).await;
                            continue;
                        }
                    };

                    if let Err(e) = run_with_retry(handler.as_ref(), &task, &retry, &cancel).await {
                        error!(
                            "task for monitor {} exhausted retries: {e:#}, dead-lettering",
                            task.monitor_id
                        );
                        let _: Result<(), _> = conn.lpush(&dead_key, payload).await;
                    }
                }

                debug!("worker {worker_id} stopped");
            });
        }

        while pool.join_next().await.is_some() {}
        Ok(())
    }
}
