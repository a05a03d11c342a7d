//! Container command history.
//!
//! - `GET /container/store/{id}/history`: entries recorded for a container
//! - `PUT /container/store/{id}/history`: append `{"text", "cwd"}`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::transcript::{HistoryEntry, TranscriptSink};
use crate::AppState;

#[derive(Deserialize)]
pub struct HistoryRequest {
    pub text: String,
    pub cwd: String,
}

/// `GET /container/store/{id}/history`
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<HistoryEntry>> {
    Json(state.transcript.history(&id).await)
}

/// `PUT /container/store/{id}/history`
pub async fn append_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HistoryRequest>,
) -> Result<&'static str, (StatusCode, Json<Value>)> {
    if req.text.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "text is required"})),
        ));
    }
    let entry = HistoryEntry::from([
        ("text".to_string(), req.text),
        ("cwd".to_string(), req.cwd),
    ]);
    state.transcript.append(&id, entry).await;
    Ok("ok")
}
