//! Liveness endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /`: bare liveness check.
pub async fn root() -> &'static str {
    "ok"
}

/// `GET /health`: status, uptime, version, live sessions and worker count.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.pool.size().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "workers": state.workers.worker_count(),
    }))
}
