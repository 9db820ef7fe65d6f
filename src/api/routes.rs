//! REST handlers for monitor CRUD and history queries

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::ApiState;
use crate::hub;
use crate::store::CatalogStore as _;
use crate::types::{Monitor, Observation};

#[derive(Debug, Deserialize)]
pub struct CreateMonitorRequest {
    pub url: String,
    pub interval_seconds: u32,
}

#[derive(Debug, Serialize)]
pub struct MonitorsResponse {
    pub monitors: Vec<Monitor>,
}

#[derive(Debug, Serialize)]
pub struct MonitorStatsResponse {
    pub stats: Vec<Observation>,
}

/// POST /api/v1/monitors
pub async fn create_monitor(
    State(state): State<ApiState>,
    Json(request): Json<CreateMonitorRequest>,
) -> ApiResult<(StatusCode, Json<Monitor>)> {
    let monitor = state
        .store
        .create_monitor(&request.url, request.interval_seconds)
        .await?;

    Ok((StatusCode::CREATED, Json(monitor)))
}

/// GET /api/v1/monitors
pub async fn list_monitors(State(state): State<ApiState>) -> ApiResult<Json<MonitorsResponse>> {
    let monitors = state.store.list_monitors().await?;
    Ok(Json(MonitorsResponse { monitors }))
}

/// DELETE /api/v1/monitors/:id
pub async fn delete_monitor(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_monitor_id(&id)?;
    state.store.delete_monitor(id).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/v1/monitors/:id/stats
pub async fn get_monitor_stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MonitorStatsResponse>> {
    let id = parse_monitor_id(&id)?;
    let stats = state.store.get_observations(id).await?;
    Ok(Json(MonitorStatsResponse { stats }))
}

/// GET /ws - upgrade and hand the socket to the hub
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| hub::serve_socket(socket, state.hub.clone()))
}

fn parse_monitor_id(raw: &str) -> ApiResult<Uuid> {
    raw.parse()
        .map_err(|_| ApiError::InvalidRequest("invalid monitor id format".to_string()))
}
