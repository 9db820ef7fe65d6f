//! Control plane: REST CRUD over monitors, history queries, the live
//! WebSocket endpoint and the streamed system stats.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/monitors` - register a monitor
//! - `GET /api/v1/monitors` - list monitors
//! - `DELETE /api/v1/monitors/:id` - remove a monitor
//! - `GET /api/v1/monitors/:id/stats` - probe history with timings
//! - `GET /api/v1/system/stats` - SSE stream of host metrics
//! - `WS /ws` - live fan-out subscription

pub mod error;
pub mod routes;
pub mod stream;

pub use error::{ApiError, ApiResult};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{delete, get},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::hub::HubHandle;
use crate::store::CatalogStore;

/// Shared state passed to all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn CatalogStore>,
    pub hub: HubHandle,
}

/// Assemble the router. CORS is wide open for dev dashboards.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/v1/monitors",
            get(routes::list_monitors).post(routes::create_monitor),
        )
        .route("/api/v1/monitors/:id", delete(routes::delete_monitor))
        .route("/api/v1/monitors/:id/stats", get(routes::get_monitor_stats))
        .route("/api/v1/system/stats", get(stream::system_stats_stream))
        .route("/ws", get(routes::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind and serve in a background task; returns the bound address.
pub async fn serve(bind_addr: SocketAddr, state: ApiState) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("control plane listening on {addr}");

    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("control plane server error: {e}");
        }
    });

    Ok(addr)
}
