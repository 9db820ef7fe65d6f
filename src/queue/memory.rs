//! In-process work queue
//!
//! A bounded mpsc channel with a worker pool sharing the receiving side.
//! Dead-lettered tasks stay inspectable, which the test suite relies on.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{
    run_with_retry, QueueError, QueueResult, RetryPolicy, TaskHandler, TaskQueue, QUEUE_CAPACITY,
};
use crate::types::ProbeTask;

#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::Sender<ProbeTask>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ProbeTask>>>,
    dead: Arc<Mutex<Vec<ProbeTask>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            dead: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Tasks that exhausted their retries.
    pub fn dead_letters(&self) -> Vec<ProbeTask> {
        self.dead.lock().expect("dead-letter lock poisoned").clone()
    }

    /// Pending tasks currently in the channel.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: &ProbeTask) -> QueueResult<()> {
        self.tx.try_send(task.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => {
                QueueError::Unavailable("queue receiver dropped".into())
            }
        })
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
            let rx = self.rx.clone();
            let dead = self.dead.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();

            pool.spawn(async move {
                debug!("worker {worker_id} started");

                loop {
                    let task = tokio::select! {
                        _ = cancel.cancelled() => break,
                        task = async { rx.lock().await.recv().await } => match task {
                            Some(task) => task,
                            None => break,
                        },
                    };

                    if let Err(e) = run_with_retry(handler.as_ref(), &task, &retry, &cancel).await {
                        error!(
                            "task for monitor {} exhausted retries: {e:#}, dead-lettering",
                            task.monitor_id
                        );
                        dead.lock().expect("dead-letter lock poisoned").push(task);
                    }
                }

                debug!("worker {worker_id} stopped");
            });
        }

        while pool.join_next().await.is_some() {}
        Ok(())
    }
}
