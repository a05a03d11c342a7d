//! Downstream proxy bridge: a WebSocket link to the relay process on the
//! session's worker host (`ws://<host>:<port><path>`).
//!
//! Dialing and starting are separate steps. [`ProxyBridge::connect`] dials
//! and parks the stream so the session can report a dial failure before it
//! commits to opening the shell; [`ProxyBridge::start`] then spawns the
//! reader and writer tasks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{BridgeError, BridgeState, StateCell};
use crate::config::{ProxyConfig, ServerConfig};
use crate::message::Message;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

const INPUT_CAPACITY: usize = 64;

/// Socket deadlines for the proxy link.
#[derive(Debug, Clone, Copy)]
pub struct ProxyTimings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl From<&ServerConfig> for ProxyTimings {
    fn from(server: &ServerConfig) -> Self {
        Self {
            write_wait: server.write_wait(),
            pong_wait: server.pong_wait(),
            ping_period: server.ping_period(),
        }
    }
}

struct ProxyLink {
    input: mpsc::Sender<Message>,
    sink: WsSink,
    stop: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct ProxyBridge {
    label: String,
    url: String,
    timings: ProxyTimings,
    replies: mpsc::Sender<Message>,
    state: Arc<StateCell>,
    parked: Mutex<Option<WsStream>>,
    link: Mutex<Option<ProxyLink>>,
    trace: bool,
}

impl ProxyBridge {
    pub fn new(
        session_id: &str,
        host: &str,
        proxy: &ProxyConfig,
        timings: ProxyTimings,
        replies: mpsc::Sender<Message>,
        trace: bool,
    ) -> Self {
        Self {
            label: format!("proxy-{session_id}"),
            url: format!("ws://{host}:{}{}", proxy.port, proxy.path),
            timings,
            replies,
            state: Arc::new(StateCell::default()),
            parked: Mutex::new(None),
            link: Mutex::new(None),
            trace,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == BridgeState::Open
    }

    /// Dial the relay. On success the stream is parked and the bridge is
    /// `Connecting`; call [`start`](Self::start) to begin relaying. Already
    /// connecting or open is a no-op.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        if !self
            .state
            .transition(BridgeState::Closed, BridgeState::Connecting)
        {
            debug!(label = %self.label, state = ?self.state.get(), "Proxy connect ignored");
            return Ok(());
        }
        let dialed =
            tokio::time::timeout(self.timings.write_wait, tokio_tungstenite::connect_async(&self.url))
                .await;
        let stream = match dialed {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(self.dial_failed(e.to_string())),
            Err(_) => return Err(self.dial_failed("connection timed out".to_string())),
        };
        *self.parked.lock().await = Some(stream);
        debug!(label = %self.label, url = %self.url, "Proxy connected");
        Ok(())
    }

    fn dial_failed(&self, message: String) -> BridgeError {
        self.state
            .transition(BridgeState::Connecting, BridgeState::Closed);
        warn!(label = %self.label, url = %self.url, "Proxy dial failed: {message}");
        BridgeError::Dial {
            target: self.url.clone(),
            message,
        }
    }

    /// Start relaying on the parked stream. No-op unless connected and not
    /// yet started.
    pub async fn start(&self, cancel: &CancellationToken) {
        let Some(stream) = self.parked.lock().await.take() else {
            debug!(label = %self.label, "Proxy start without a connected stream ignored");
            return;
        };
        let mut link = self.link.lock().await;
        if !self
            .state
            .transition(BridgeState::Connecting, BridgeState::Open)
        {
            return;
        }

        let (sink, stream) = stream.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let stop = CancellationToken::new();

        let reader = tokio::spawn(read_relay(
            self.label.clone(),
            stream,
            self.replies.clone(),
            Arc::clone(&self.state),
            self.timings.pong_wait,
            cancel.clone(),
            stop.clone(),
            self.trace,
        ));
        let writer = tokio::spawn(write_relay(
            self.label.clone(),
            Arc::clone(&sink),
            input_rx,
            self.timings,
            cancel.clone(),
            stop.clone(),
        ));
        *link = Some(ProxyLink {
            input: input_tx,
            sink,
            stop,
            reader,
            writer,
        });
        info!(label = %self.label, url = %self.url, "Proxy bridge open");
    }

    /// Close the link: best-effort Normal close frame, then local close.
    /// Idempotent; a parked (connected but unstarted) stream is dropped too.
    pub async fn stop(&self) -> bool {
        let previous = self.state.replace(BridgeState::Closed);
        if let Some(mut parked) = self.parked.lock().await.take() {
            let _ = parked.close(None).await;
        }
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.stop.cancel();
            {
                let mut sink = link.sink.lock().await;
                let frame = WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static(""),
                }));
                match tokio::time::timeout(self.timings.write_wait, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(label = %self.label, "Proxy close frame failed: {e}"),
                    Err(_) => debug!(label = %self.label, "Proxy close frame timed out"),
                }
                let _ = tokio::time::timeout(self.timings.write_wait, sink.close()).await;
            }
            let _ = link.writer.await;
            let _ = tokio::time::timeout(self.timings.write_wait, link.reader).await;
        }
        if previous == BridgeState::Open {
            info!(label = %self.label, "Proxy bridge closed");
        }
        previous == BridgeState::Open
    }

    /// Queue a message for the relay. Dropped unless `Open`.
    pub async fn send(&self, message: Message) -> bool {
        if !self.is_open() {
            trace!(label = %self.label, "Proxy not open, message dropped: {message:?}");
            return false;
        }
        let input = match self.link.lock().await.as_ref() {
            Some(link) => link.input.clone(),
            None => return false,
        };
        input.send(message).await.is_ok()
    }
}

/// Relay frames -> reply queue. Ends on close, error, malformed JSON, read
/// deadline, or cancellation.
#[allow(clippy::too_many_arguments)]
async fn read_relay(
    label: String,
    mut stream: SplitStream<WsStream>,
    replies: mpsc::Sender<Message>,
    state: Arc<StateCell>,
    pong_wait: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
    trace: bool,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            () = stop.cancelled() => break,
            frame = tokio::time::timeout(pong_wait, stream.next()) => frame,
        };
        let frame = match frame {
            Err(_) => {
                warn!(label = %label, "Proxy read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(label = %label, "Proxy read error: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            WsMessage::Text(text) => {
                let message: Message = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(label = %label, "Malformed proxy frame: {e}");
                        break;
                    }
                };
                if trace {
                    trace!(label = %label, "Proxy message: {message:?}");
                }
                if replies.send(message).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // ping/pong/binary only refresh the deadline
            _ => {}
        }
    }
    if state.transition(BridgeState::Open, BridgeState::Closed) {
        info!(label = %label, "Proxy link ended");
    }
}

/// Input queue -> relay frames, plus keep-alive pings.
async fn write_relay(
    label: String,
    sink: WsSink,
    mut input: mpsc::Receiver<Message>,
    timings: ProxyTimings,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(timings.ping_period);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            () = stop.cancelled() => break,
            message = input.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => WsMessage::Text(text.into()),
                    Err(e) => {
                        warn!(label = %label, "Proxy encode failed: {e}");
                        continue;
                    }
                }
            }
            _ = ticker.tick() => WsMessage::Ping(Bytes::new()),
        };
        let mut sink = sink.lock().await;
        match tokio::time::timeout(timings.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(label = %label, "Proxy write failed: {e}");
                break;
            }
            Err(_) => {
                warn!(label = %label, "Proxy write deadline exceeded");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn timings() -> ProxyTimings {
        ProxyTimings {
            write_wait: Duration::from_secs(2),
            pong_wait: Duration::from_secs(5),
            ping_period: Duration::from_secs(4),
        }
    }

    fn proxy_config(port: u16) -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            port,
            path: "/websocket".to_string(),
        }
    }

    /// Accepts one relay connection and echoes text frames back.
    async fn echo_relay() -> (u16, JoinHandle<Option<CloseCode>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                match frame {
                    WsMessage::Text(_) => ws.send(frame).await.unwrap(),
                    WsMessage::Close(close) => return close.map(|c| c.code),
                    _ => {}
                }
            }
            None
        });
        (port, server)
    }

    #[tokio::test]
    async fn relays_messages_and_closes_normally() {
        let (port, server) = echo_relay().await;
        let (tx, mut rx) = mpsc::channel(8);
        let proxy = ProxyBridge::new("abc", "127.0.0.1", &proxy_config(port), timings(), tx, false);
        assert_eq!(proxy.label(), "proxy-abc");
        assert_eq!(proxy.url(), format!("ws://127.0.0.1:{port}/websocket"));

        proxy.connect().await.unwrap();
        assert_eq!(proxy.state(), BridgeState::Connecting);
        let cancel = CancellationToken::new();
        proxy.start(&cancel).await;
        assert!(proxy.is_open());

        let msg = Message::new("client/containerID", "c0ffee");
        assert!(proxy.send(msg.clone()).await);
        assert_eq!(rx.recv().await.unwrap(), msg);

        assert!(proxy.stop().await);
        assert!(!proxy.stop().await);
        assert_eq!(server.await.unwrap(), Some(CloseCode::Normal));
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, _rx) = mpsc::channel(8);
        let proxy = ProxyBridge::new("abc", "127.0.0.1", &proxy_config(port), timings(), tx, false);
        assert!(matches!(
            proxy.connect().await,
            Err(BridgeError::Dial { .. })
        ));
        assert_eq!(proxy.state(), BridgeState::Closed);
        assert!(!proxy.send(Message::xterm("x")).await);
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_start_requires_connect() {
        let (port, _server) = echo_relay().await;
        let (tx, _rx) = mpsc::channel(8);
        let proxy = ProxyBridge::new("abc", "127.0.0.1", &proxy_config(port), timings(), tx, false);

        proxy.start(&CancellationToken::new()).await;
        assert_eq!(proxy.state(), BridgeState::Closed);

        proxy.connect().await.unwrap();
        proxy.connect().await.unwrap();
        proxy.start(&CancellationToken::new()).await;
        assert!(proxy.is_open());
        proxy.stop().await;
    }
}
