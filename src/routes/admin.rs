//! Administrative endpoints.
//!
//! - `GET    /admin/build`    : version and build metadata
//! - `GET    /admin/pool`     : live session count
//! - `POST   /admin/broadcast`: send a message to every session
//! - `POST   /admin/direct`   : send a message to listed sessions
//! - `GET    /admin/rules`    : current block/prompt rules
//! - `POST   /admin/rules`    : merge patterns into the rules
//! - `DELETE /admin/rules`    : remove patterns from the rules

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::message::{DirectMessage, Message};
use crate::rules::Rules;
use crate::AppState;

/// `GET /admin/build`
pub async fn build() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("TERMGATE_COMMIT").unwrap_or("unknown"),
        "build": option_env!("TERMGATE_BUILD").unwrap_or("unknown"),
    }))
}

/// `GET /admin/pool`
pub async fn pool(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"size": state.pool.size().await}))
}

/// `POST /admin/broadcast`: body is a `{channel, payload}` message.
pub async fn broadcast(
    State(state): State<AppState>,
    Json(message): Json<Message>,
) -> Json<Value> {
    info!(channel = %message.channel, "Broadcast requested");
    state.pool.broadcast(message).await;
    Json(json!({"status": "ok"}))
}

/// `POST /admin/direct`: body is `{message, clients}`. Unknown session IDs
/// are skipped.
pub async fn direct(
    State(state): State<AppState>,
    Json(direct): Json<DirectMessage>,
) -> Json<Value> {
    let targets = direct.clients.len();
    state.pool.direct(direct.message, direct.clients).await;
    Json(json!({"status": "ok", "targets": targets}))
}

/// `GET /admin/rules`
pub async fn get_rules(State(state): State<AppState>) -> Json<Rules> {
    Json(state.rules.get().await)
}

/// `POST /admin/rules`: append the given patterns; returns the new rules.
pub async fn merge_rules(
    State(state): State<AppState>,
    Json(extra): Json<Rules>,
) -> Json<Rules> {
    info!(block = extra.block.len(), prompt = extra.prompt.len(), "Merging rules");
    Json(state.rules.merge(&extra).await)
}

/// `DELETE /admin/rules`: drop exact matches; returns the new rules.
pub async fn remove_rules(
    State(state): State<AppState>,
    Json(gone): Json<Rules>,
) -> Json<Rules> {
    info!(block = gone.block.len(), prompt = gone.prompt.len(), "Removing rules");
    Json(state.rules.remove(&gone).await)
}
