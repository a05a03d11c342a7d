//! Worker pool visibility.
//!
//! - `GET /docker/nodes`             : live sessions per worker
//! - `GET /docker/{idx}/containers`  : containers running on one worker

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::workers::{WorkerError, WorkerLoad};
use crate::AppState;

/// `GET /docker/nodes`
pub async fn nodes(State(state): State<AppState>) -> Json<Vec<WorkerLoad>> {
    let snapshot = state.pool.snapshot().await;
    Json(state.workers.live_sessions_per_host(&snapshot))
}

/// `GET /docker/{idx}/containers`
pub async fn containers(
    State(state): State<AppState>,
    Path(idx): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let idx: usize = idx.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid worker index: {idx}")})),
        )
    })?;
    let worker = state.workers.resolve(idx).map_err(|e| {
        let status = match e {
            WorkerError::OutOfRange { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": e.to_string()})))
    })?;
    let containers = worker.runtime.list_containers().await.map_err(|e| {
        warn!(host = %worker.host, "Container listing failed: {e}");
        (StatusCode::BAD_GATEWAY, Json(json!({"error": e.to_string()})))
    })?;
    Ok(Json(containers))
}
