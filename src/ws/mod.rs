//! WebSocket endpoint for browser terminals.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws/{idx}` (or `GET /ws` for worker 0). The
//!    index is parsed and resolved against the worker pool before the upgrade
//!    completes: `400` if it is not a number, `404` if out of range.
//! 2. A [`Session`] is created, registered with the pool, and the client is
//!    sent `{"channel":"id","payload":"<session id>"}`.
//! 3. Three tasks serve the socket until the session closes:
//!    - the read loop (this task) parses frames and calls [`Session::route`];
//!    - the writer drains the session's reply queue onto the socket;
//!    - the keep-alive task pings the client every `ping_period`.
//!
//!    Every frame received (including pongs) refreshes the read deadline;
//!    every write carries its own deadline. Any failure closes the session,
//!    which cancels the other tasks.
//! 4. Teardown waits for the writer and keep-alive tasks before the socket
//!    is closed.
//!
//! All frames are `{"channel": string, "payload": string}` JSON text. A frame
//! that does not parse ends the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::ServerConfig;
use crate::message::Message;
use crate::session::Session;
use crate::workers::WorkerError;
use crate::AppState;

type WsSink = Arc<Mutex<SplitSink<WebSocket, WsMessage>>>;

/// `GET /ws`: upgrade against worker 0.
pub async fn ws_upgrade_default(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    upgrade(state, 0, ws)
}

/// `GET /ws/{idx}`: upgrade against the worker at `idx`.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(idx): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(idx) = idx.parse::<usize>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid worker index: {idx}")})),
        )
            .into_response();
    };
    upgrade(state, idx, ws)
}

fn upgrade(state: AppState, idx: usize, ws: WebSocketUpgrade) -> Response {
    let host = match state.workers.resolve(idx) {
        Ok(worker) => worker.host.clone(),
        Err(e @ WorkerError::OutOfRange { .. }) => {
            return (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    let read_limit = state.config.server.read_limit;
    ws.max_message_size(read_limit)
        .max_frame_size(read_limit)
        .on_upgrade(move |socket| handle_ws(socket, state, host))
}

async fn handle_ws(socket: WebSocket, state: AppState, host: String) {
    let (session, replies) = Session::new(&host, &state.session_deps());
    let span = info_span!("session", session_id = %session.id(), host = %host);
    serve_session(
        socket,
        session,
        replies,
        &state.config.server,
        state.config.logging.trace,
    )
    .instrument(span)
    .await;
}

/// Drive one session over an upgraded socket until it closes.
pub async fn serve_session(
    socket: WebSocket,
    session: Arc<Session>,
    replies: mpsc::Receiver<Message>,
    server: &ServerConfig,
    trace: bool,
) {
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));
    let cancel = session.cancel_token();

    session.register().await;
    info!("Client connected");

    let writer = tokio::spawn(
        write_replies(
            Arc::clone(&session),
            Arc::clone(&sink),
            replies,
            server.write_wait(),
            cancel.clone(),
        )
        .in_current_span(),
    );
    let keepalive = tokio::spawn(
        keep_alive(
            Arc::clone(&session),
            Arc::clone(&sink),
            server.ping_period(),
            server.write_wait(),
            cancel.clone(),
        )
        .in_current_span(),
    );

    read_loop(&session, &mut stream, server.pong_wait(), &cancel, trace).await;
    session.close().await;

    let _ = writer.await;
    let _ = keepalive.await;
    let _ = tokio::time::timeout(server.write_wait(), async {
        let _ = sink.lock().await.close().await;
    })
    .await;
    info!("Client disconnected");
}

async fn read_loop(
    session: &Arc<Session>,
    stream: &mut SplitStream<WebSocket>,
    pong_wait: Duration,
    cancel: &CancellationToken,
    trace: bool,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = tokio::time::timeout(pong_wait, stream.next()) => frame,
        };
        let frame = match frame {
            Err(_) => {
                warn!("Read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("Read error: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            WsMessage::Text(text) => {
                let message: Message = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Malformed client frame: {e}");
                        break;
                    }
                };
                if trace {
                    trace!("Client message: {message:?}");
                }
                session.route(message).await;
            }
            WsMessage::Close(_) => break,
            // pongs and anything else only refresh the deadline
            _ => {}
        }
    }
}

async fn write_replies(
    session: Arc<Session>,
    sink: WsSink,
    mut replies: mpsc::Receiver<Message>,
    write_wait: Duration,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = replies.recv() => message,
        };
        let Some(message) = message else { break };
        session.inspect_reply(&message).await;
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode reply: {e}");
                continue;
            }
        };
        if !send_with_deadline(&sink, WsMessage::Text(text.into()), write_wait).await {
            session.close().await;
            break;
        }
    }
}

async fn keep_alive(
    session: Arc<Session>,
    sink: WsSink,
    ping_period: Duration,
    write_wait: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ping_period);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !send_with_deadline(&sink, WsMessage::Ping(Bytes::new()), write_wait).await {
                    session.close().await;
                    break;
                }
            }
        }
    }
}

async fn send_with_deadline(sink: &WsSink, frame: WsMessage, write_wait: Duration) -> bool {
    let mut sink = sink.lock().await;
    match tokio::time::timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Write failed: {e}");
            false
        }
        Err(_) => {
            warn!("Write deadline exceeded");
            false
        }
    }
}
