//! Helpers shared by the integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pulsar::bus::MemoryBus;
use pulsar::queue::{MemoryQueue, RetryPolicy, TaskQueue};
use pulsar::store::MemoryCatalog;
use pulsar::worker::{Poller, ProbeExecutor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Serve the same canned HTTP response to every connection.
pub async fn serve_http(status_line: &'static str, body: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 2048];
                let _ = socket.read(&mut request).await;

                let head = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// An address nothing is listening on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// The worker side of the pipeline: a fast-ticking scheduler plus a small
/// probe-executor pool over the in-memory store/bus/queue.
pub fn start_pipeline(
    store: Arc<MemoryCatalog>,
    bus: Arc<MemoryBus>,
    queue: Arc<MemoryQueue>,
    tick: Duration,
    cancel: CancellationToken,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let poller = Poller::new(store.clone(), queue.clone()).with_tick_period(tick);
    let poller_task = tokio::spawn(poller.run(cancel.clone()));

    let executor = Arc::new(
        ProbeExecutor::new(store, bus).with_timeout(Duration::from_secs(2)),
    );
    let consume_task = tokio::spawn(async move {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let _ = queue.consume(executor, 2, retry, cancel).await;
    });

    (poller_task, consume_task)
}

/// Poll `probe` every 25 ms until it returns true or the deadline hits.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
