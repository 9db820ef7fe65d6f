use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use pulsar::{
    api::{self, ApiState},
    bus::{MessageBus, RedisBus},
    config::Config,
    hub::{self, HubHandle},
    store::{CatalogStore, PgCatalog},
    LIVE_TOPIC,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Bind address for the control plane
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("pulsar", LevelFilter::DEBUG),
        ("api", LevelFilter::DEBUG),
        ("tower_http", LevelFilter::INFO),
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

    // A missing store at boot is the one fatal condition.
    let store: Arc<dyn CatalogStore> = Arc::new(PgCatalog::connect(&config.database_url).await?);

    let cancel = CancellationToken::new();
    let hub = HubHandle::spawn(cancel.clone());

    // The live feed is best-effort: without the broker the hub simply has
    // nothing to mirror, the REST surface keeps working.
    match RedisBus::connect(&config.redis_addr).await {
        Ok(bus) => {
            let bus: Arc<dyn MessageBus> = Arc::new(bus);
            tokio::spawn(hub::forward_bus(bus, LIVE_TOPIC, hub.clone(), cancel.clone()));
        }
        Err(e) => warn!("message bus unavailable: {e}, live stream disabled"),
    }

    let state = ApiState { store, hub };
    api::serve(args.bind, state).await?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    cancel.cancel();
    info!("hub closed, exiting");

    Ok(())
}
