use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pulsar::{
    bus::{MessageBus, RedisBus},
    config::Config,
    queue::{RedisQueue, RetryPolicy, TaskQueue, WORKER_CONCURRENCY},
    store::{CatalogStore, PgCatalog},
    worker::{HostSampler, Poller, ProbeExecutor},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Probe executor workers
    #[arg(long, default_value_t = WORKER_CONCURRENCY)]
    workers: usize,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("pulsar", LevelFilter::DEBUG),
        ("worker", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    let config = Config::from_env();

    // A missing store at boot is the one fatal condition; the broker is
    // waited for instead.
    let store: Arc<dyn CatalogStore> = Arc::new(PgCatalog::connect(&config.database_url).await?);

    let bus: Arc<dyn MessageBus> = connect_bus(&config.redis_addr).await;
    let queue: Arc<dyn TaskQueue> = connect_queue(&config.redis_addr).await;

    let cancel = CancellationToken::new();

    let poller = Poller::new(store.clone(), queue.clone());
    let poller_task = tokio::spawn(poller.run(cancel.clone()));
    info!("scheduler started");

    let sampler = HostSampler::new(store.clone(), bus.clone(), config.root_fs.clone());
    let sampler_task = tokio::spawn(sampler.run(cancel.clone()));
    info!("host sampler started");

    let executor = Arc::new(ProbeExecutor::new(store, bus));
    let consume_task = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        let workers = args.workers;
        tokio::spawn(async move {
            if let Err(e) = queue
                .consume(executor, workers, RetryPolicy::default(), cancel)
                .await
            {
                error!("worker pool stopped with error: {e}");
            }
        })
    };
    info!("probe executors started ({} workers)", args.workers);

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    cancel.cancel();

    let _ = poller_task.await;
    let _ = sampler_task.await;
    let _ = consume_task.await;

    info!("all tasks stopped, exiting");
    Ok(())
}

/// The broker comes and goes in dev; keep retrying with capped backoff.
async fn connect_bus(addr: &str) -> Arc<dyn MessageBus> {
    let mut backoff = Duration::from_secs(1);
    loop {
        match RedisBus::connect(addr).await {
            Ok(bus) => return Arc::new(bus),
            Err(e) => {
                warn!("message bus unavailable: {e}, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}

async fn connect_queue(addr: &str) -> Arc<dyn TaskQueue> {
    let mut backoff = Duration::from_secs(1);
    loop {
        match RedisQueue::connect(addr, "default").await {
            Ok(queue) => return Arc::new(queue),
            Err(e) => {
                warn!("work queue unavailable: {e}, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}
