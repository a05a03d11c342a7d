//! One browser connection and the outbound links it drives.
//!
//! ## States
//!
//! `Idle` (socket open, no shell) -> `Connecting` (bridges dialing) ->
//! `Active` (shell open) -> `Idle` (after `ssh/disconnect`, or when the shell
//! dies on its own) -> `Closed` (terminal). Any socket failure goes straight
//! to `Closed` through [`Session::close`].
//!
//! ## Client messages
//!
//! | Channel           | When             | Action                                        |
//! |-------------------|------------------|-----------------------------------------------|
//! | `xterm`           | shell open       | rule check, then forward to the shell         |
//! | `xterm`           | otherwise        | dropped (trace only)                          |
//! | `terminal/resize` | any              | update the shell's terminal size              |
//! | `ping`            | any              | reply `pong` with `PONG <payload>`            |
//! | `ssh/connect`     | shell not open   | dial proxy, start proxy, start shell          |
//! | `ssh/disconnect`  | any              | stop shell, stop proxy, reply the banner      |
//! | `rules/confirm`   | line held        | release the held Enter to the shell           |
//! | anything else     | proxy open       | forwarded to the worker relay                 |
//!
//! `ssh/connect` runs on its own task under a per-attempt child of the
//! session token, so the read loop keeps serving `ping` and `ssh/disconnect`
//! while the links dial. Disconnect and close cancel the attempt.
//!
//! Everything the bridges produce lands on one reply queue drained by the
//! connection's writer task, which calls [`Session::inspect_reply`] before
//! each write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::bridge::proxy::ProxyTimings;
use crate::bridge::{BridgeError, ProxyBridge, ShellBridge, ShellDialer, ShellTarget};
use crate::config::{ProxyConfig, SshConfig};
use crate::message::{channel, Message, TerminalSize, DISCONNECTED_BANNER};
use crate::pool::{PoolHandle, PoolMember};
use crate::rules::{RuleSet, Verdict};
use crate::transcript::{HistoryEntry, TranscriptSink};

/// Capacity of the per-session reply queue.
pub const REPLY_CAPACITY: usize = 256;

/// Sent to the shell after a blocked line so the remote prompt is cleared.
const KILL_LINE: &str = "\u{15}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closed,
}

/// Shared collaborators every session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub pool: PoolHandle,
    pub rules: Arc<RuleSet>,
    pub transcript: Arc<dyn TranscriptSink>,
    pub dialer: Arc<dyn ShellDialer>,
    pub ssh: SshConfig,
    pub proxy: ProxyConfig,
    pub timings: ProxyTimings,
    pub trace: bool,
}

#[derive(Debug)]
struct HeldLine {
    line: String,
    pattern: String,
    /// Input that arrived after the held Enter in the same payload.
    rest: String,
}

/// Position inside a terminal escape sequence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    Text,
    /// Just saw ESC.
    Start,
    /// `ESC [` ... until a final byte in `@`..=`~`.
    Csi,
    /// `ESC O`: one more char ends it.
    Ss3,
}

/// Tracks what the user has typed on the current shell line.
#[derive(Debug, Default)]
struct LineGate {
    line: String,
    held: Option<HeldLine>,
    escape: Escape,
}

impl LineGate {
    /// Feed one input char. Escape sequences (arrows, function keys, the
    /// bracketed-paste markers) are skipped; the text around them is kept.
    fn track(&mut self, c: char) {
        match self.escape {
            Escape::Text => {}
            Escape::Start => {
                self.escape = match c {
                    '[' => Escape::Csi,
                    'O' => Escape::Ss3,
                    _ => Escape::Text,
                };
                return;
            }
            Escape::Csi => {
                if ('@'..='~').contains(&c) {
                    self.escape = Escape::Text;
                }
                return;
            }
            Escape::Ss3 => {
                self.escape = Escape::Text;
                return;
            }
        }
        match c {
            '\u{1b}' => self.escape = Escape::Start,
            '\u{7f}' | '\u{8}' => {
                self.line.pop();
            }
            '\u{3}' | '\u{15}' => self.line.clear(),
            c if !c.is_control() => self.line.push(c),
            _ => {}
        }
    }
}

pub struct Session {
    id: String,
    host: String,
    replies: mpsc::Sender<Message>,
    pool: PoolHandle,
    rules: Arc<RuleSet>,
    transcript: Arc<dyn TranscriptSink>,
    shell: ShellBridge,
    proxy: Option<ProxyBridge>,
    cancel: CancellationToken,
    /// Token of the latest `ssh/connect` attempt, a child of `cancel`.
    attempt: Mutex<CancellationToken>,
    /// Serializes opening and stopping the bridges.
    lifecycle: Mutex<()>,
    connecting: AtomicBool,
    closed: AtomicBool,
    correlation: Mutex<Option<String>>,
    gate: Mutex<LineGate>,
}

impl Session {
    /// Create a session targeting `host`. Returns the session and the
    /// receiving end of its reply queue, which the writer task drains.
    pub fn new(host: &str, deps: &SessionDeps) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let id = Uuid::new_v4().to_string();
        let (replies, rx) = mpsc::channel(REPLY_CAPACITY);
        let shell = ShellBridge::new(
            format!("ssh-{id}"),
            ShellTarget::new(host, &deps.ssh),
            Arc::clone(&deps.dialer),
            replies.clone(),
            deps.trace,
        );
        let proxy = deps.proxy.enabled.then(|| {
            ProxyBridge::new(
                &id,
                host,
                &deps.proxy,
                deps.timings,
                replies.clone(),
                deps.trace,
            )
        });
        let cancel = CancellationToken::new();
        let attempt = cancel.child_token();
        let session = Arc::new(Self {
            id,
            host: host.to_string(),
            replies,
            pool: deps.pool.clone(),
            rules: Arc::clone(&deps.rules),
            transcript: Arc::clone(&deps.transcript),
            shell,
            proxy,
            cancel,
            attempt: Mutex::new(attempt),
            lifecycle: Mutex::new(()),
            connecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            correlation: Mutex::new(None),
            gate: Mutex::new(LineGate::default()),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Token shared by every task this session spawns.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.connecting.load(Ordering::Acquire) {
            SessionState::Connecting
        } else if self.shell.is_open() {
            SessionState::Active
        } else {
            SessionState::Idle
        }
    }

    pub fn shell(&self) -> &ShellBridge {
        &self.shell
    }

    pub fn proxy(&self) -> Option<&ProxyBridge> {
        self.proxy.as_ref()
    }

    pub async fn correlation_id(&self) -> Option<String> {
        self.correlation.lock().await.clone()
    }

    /// Join the pool and tell the client its session ID.
    pub async fn register(&self) {
        self.pool
            .register(PoolMember {
                id: self.id.clone(),
                host: self.host.clone(),
                tx: self.replies.clone(),
            })
            .await;
        self.pool
            .direct(Message::new(channel::ID, self.id.clone()), vec![self.id.clone()])
            .await;
    }

    async fn reply(&self, message: Message) {
        if self.replies.send(message).await.is_err() {
            trace!(session_id = %self.id, "Reply queue closed, reply dropped");
        }
    }

    /// Route one inbound client message.
    pub async fn route(self: &Arc<Self>, message: Message) {
        match message.channel.as_str() {
            channel::XTERM => self.forward_input(&message.payload).await,
            channel::RESIZE => match TerminalSize::from_payload(&message.payload) {
                Ok(size) => {
                    debug!(session_id = %self.id, cols = size.cols, rows = size.rows, "Resize terminal");
                    self.shell.resize(size);
                }
                Err(e) => warn!(session_id = %self.id, "Bad resize payload: {e}"),
            },
            channel::PING => self.reply(Message::pong(&message.payload)).await,
            channel::SSH_CONNECT => self.begin_connect().await,
            channel::SSH_DISCONNECT => self.disconnect().await,
            channel::RULES_CONFIRM => self.confirm().await,
            _ => self.forward_to_proxy(message).await,
        }
    }

    async fn forward_to_proxy(&self, message: Message) {
        match &self.proxy {
            Some(proxy) if proxy.is_open() => {
                proxy.send(message).await;
            }
            _ => {
                trace!(session_id = %self.id, channel = %message.channel, "Unrouted client message dropped");
            }
        }
    }

    /// Forward terminal input, consulting the rule set on every completed
    /// line. A blocked line loses its Enter (and the remote line is killed);
    /// a prompted line has its Enter held until `rules/confirm`.
    async fn forward_input(&self, payload: &str) {
        if !self.shell.is_open() {
            trace!(session_id = %self.id, "No open shell, input dropped");
            return;
        }
        let mut gate = self.gate.lock().await;
        if let Some(held) = gate.held.take() {
            debug!(session_id = %self.id, pattern = %held.pattern, "Held line released without confirmation");
            if !held.rest.is_empty() {
                debug!(session_id = %self.id, bytes = held.rest.len(), "Input queued behind the held line dropped");
            }
            gate.line = held.line;
        }
        self.apply_gate(&mut gate, payload).await;
    }

    /// Send `payload` to the shell, checking each completed line. Stops at a
    /// prompted line and keeps the remainder with the hold.
    async fn apply_gate(&self, gate: &mut LineGate, payload: &str) {
        let mut start = 0;
        for (i, c) in payload.char_indices() {
            if c != '\r' {
                gate.track(c);
                continue;
            }
            gate.escape = Escape::Text;
            let line = std::mem::take(&mut gate.line);
            match self.rules.check(&line).await {
                Verdict::Allow => {}
                Verdict::Block(pattern) => {
                    warn!(session_id = %self.id, pattern = %pattern, "Input line blocked");
                    self.shell
                        .send(&format!("{}{KILL_LINE}", &payload[start..i]))
                        .await;
                    start = i + 1;
                    let notice = json!({"line": line.trim(), "pattern": pattern});
                    self.reply(Message::new(channel::RULES_BLOCKED, notice.to_string()))
                        .await;
                }
                Verdict::Prompt(pattern) => {
                    info!(session_id = %self.id, pattern = %pattern, "Input line held for confirmation");
                    if start < i {
                        self.shell.send(&payload[start..i]).await;
                    }
                    let notice = json!({"line": line.trim(), "pattern": pattern});
                    gate.held = Some(HeldLine {
                        line,
                        pattern,
                        rest: payload[i + 1..].to_string(),
                    });
                    self.reply(Message::new(channel::RULES_PROMPT, notice.to_string()))
                        .await;
                    return;
                }
            }
        }
        if start < payload.len() {
            self.shell.send(&payload[start..]).await;
        }
    }

    async fn confirm(&self) {
        let mut gate = self.gate.lock().await;
        let Some(held) = gate.held.take() else {
            trace!(session_id = %self.id, "Confirm with no held line ignored");
            return;
        };
        info!(session_id = %self.id, pattern = %held.pattern, "Held line confirmed");
        self.shell.send("\r").await;
        self.apply_gate(&mut gate, &held.rest).await;
    }

    /// Start a connect attempt on its own task. Ignored while the shell is
    /// open or another attempt is still dialing.
    async fn begin_connect(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.shell.is_open() {
            trace!(session_id = %self.id, "Shell already open, connect ignored");
            return;
        }
        if self.connecting.swap(true, Ordering::AcqRel) {
            trace!(session_id = %self.id, "Connect already in progress");
            return;
        }
        let attempt = self.cancel.child_token();
        let previous = std::mem::replace(&mut *self.attempt.lock().await, attempt.clone());
        previous.cancel();

        let session = Arc::clone(self);
        tokio::spawn(async move { session.connect(attempt).await }.in_current_span());
    }

    async fn connect(&self, attempt: CancellationToken) {
        let opened = {
            let _lifecycle = self.lifecycle.lock().await;
            self.open_bridges(&attempt).await
        };
        self.connecting.store(false, Ordering::Release);
        match opened {
            Ok(ended) => {
                info!(
                    session_id = %self.id,
                    host = %self.host,
                    relay = ?self.proxy.as_ref().map(ProxyBridge::url),
                    "Session active"
                );
                self.follow_shell(&attempt, ended).await;
            }
            Err(BridgeError::Closed) => {
                debug!(session_id = %self.id, "Connect abandoned");
            }
            Err(e) => {
                warn!(session_id = %self.id, host = %self.host, "Connect failed: {e}");
                self.reply(Message::fatal(format!("[ERROR] {e}"))).await;
            }
        }
    }

    /// Proxy first so a dead relay is reported before any shell is opened.
    /// Returns the shell's `ended` token.
    async fn open_bridges(&self, attempt: &CancellationToken) -> Result<CancellationToken, BridgeError> {
        if let Some(proxy) = &self.proxy {
            // left over from a shell that went away on its own
            proxy.stop().await;
            let dialed = tokio::select! {
                () = attempt.cancelled() => Err(BridgeError::Closed),
                result = proxy.connect() => result,
            };
            if let Err(e) = dialed {
                proxy.stop().await;
                return Err(e);
            }
            proxy.start(attempt).await;
        }
        let started = if attempt.is_cancelled() {
            Err(BridgeError::Closed)
        } else {
            self.shell.start(attempt).await
        };
        if let Err(e) = started {
            if let Some(proxy) = &self.proxy {
                proxy.stop().await;
            }
            return Err(e);
        }
        if attempt.is_cancelled() {
            self.stop_bridges().await;
            return Err(BridgeError::Closed);
        }
        *self.gate.lock().await = LineGate::default();
        Ok(self.shell.ended().await.unwrap_or_default())
    }

    /// The proxy is paired with the shell: when the shell goes away on its
    /// own, stop the proxy too.
    async fn follow_shell(&self, attempt: &CancellationToken, ended: CancellationToken) {
        let shell_died = tokio::select! {
            () = attempt.cancelled() => false,
            () = ended.cancelled() => true,
        };
        if !shell_died {
            return;
        }
        let _lifecycle = self.lifecycle.lock().await;
        if attempt.is_cancelled() {
            return;
        }
        if let Some(proxy) = &self.proxy {
            if proxy.stop().await {
                info!(session_id = %self.id, "Shell ended, proxy stopped");
            }
        }
    }

    /// Shell first, then proxy: the reverse of startup.
    async fn stop_bridges(&self) {
        self.shell.stop().await;
        if let Some(proxy) = &self.proxy {
            proxy.stop().await;
        }
    }

    async fn disconnect(&self) {
        self.attempt.lock().await.cancel();
        {
            let _lifecycle = self.lifecycle.lock().await;
            self.stop_bridges().await;
        }
        info!(session_id = %self.id, "Session disconnected");
        self.reply(Message::xterm(DISCONNECTED_BANNER)).await;
    }

    /// Side effects applied to every outbound message just before it is
    /// written to the client. Never blocks or drops the write.
    pub async fn inspect_reply(&self, message: &Message) {
        match message.channel.as_str() {
            channel::CONTAINER_ID => {
                let id = (!message.payload.is_empty()).then(|| message.payload.clone());
                info!(session_id = %self.id, container_id = %message.payload, "Working container set");
                *self.correlation.lock().await = id;
            }
            channel::TERM_MESSAGE => {
                let entry: HistoryEntry = match serde_json::from_str(&message.payload) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(session_id = %self.id, "Malformed term/message payload: {e}");
                        return;
                    }
                };
                let Some(container_id) = self.correlation.lock().await.clone() else {
                    return;
                };
                trace!(session_id = %self.id, container_id = %container_id, "Appending history");
                self.transcript.append(&container_id, entry).await;
            }
            _ => {}
        }
    }

    /// Tear the session down: cancel every task, stop shell then proxy, leave
    /// the pool. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        {
            let _lifecycle = self.lifecycle.lock().await;
            self.stop_bridges().await;
        }
        self.pool.unregister(&self.id).await;
        *self.correlation.lock().await = None;
        info!(session_id = %self.id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::bridge::shell::fake::EchoDialer;
    use crate::bridge::BridgeState;
    use crate::pool::Pool;
    use crate::rules::Rules;
    use crate::transcript::MemoryTranscript;

    struct Harness {
        session: Arc<Session>,
        rx: mpsc::Receiver<Message>,
        dialer: Arc<EchoDialer>,
        pool: PoolHandle,
        transcript: Arc<MemoryTranscript>,
    }

    fn harness_with(dialer: EchoDialer, proxy_port: Option<u16>, rules: Rules) -> Harness {
        let dialer = Arc::new(dialer);
        let pool = Pool::spawn();
        let transcript = Arc::new(MemoryTranscript::new());
        let deps = SessionDeps {
            pool: pool.clone(),
            rules: Arc::new(RuleSet::new(rules)),
            transcript: transcript.clone(),
            dialer: dialer.clone(),
            ssh: SshConfig::default(),
            proxy: ProxyConfig {
                enabled: proxy_port.is_some(),
                port: proxy_port.unwrap_or(0),
                path: "/websocket".to_string(),
            },
            timings: ProxyTimings {
                write_wait: Duration::from_secs(2),
                pong_wait: Duration::from_secs(5),
                ping_period: Duration::from_secs(4),
            },
            trace: false,
        };
        let (session, rx) = Session::new("127.0.0.1", &deps);
        Harness {
            session,
            rx,
            dialer,
            pool,
            transcript,
        }
    }

    fn harness() -> Harness {
        harness_with(EchoDialer::default(), None, Rules::default())
    }

    fn prompt_rules(pattern: &str) -> Rules {
        Rules {
            block: vec![],
            prompt: vec![pattern.to_string()],
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply timed out")
            .expect("reply queue closed")
    }

    /// Skip replies until one on `channel` arrives.
    async fn next_on(rx: &mut mpsc::Receiver<Message>, channel: &str) -> Message {
        loop {
            let msg = next(rx).await;
            if msg.is(channel) {
                return msg;
            }
        }
    }

    /// Wait until the session has left `Connecting`.
    async fn settle(session: &Session) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.state() == SessionState::Connecting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connect never finished");
    }

    async fn connect(session: &Arc<Session>) {
        session.route(Message::new("ssh/connect", "")).await;
        settle(session).await;
    }

    /// Wait until the fake shell has seen `n` input chunks.
    async fn wait_received(dialer: &EchoDialer, n: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let received = dialer.received();
                if received.len() >= n {
                    return received;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("shell input timed out")
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Relay that echoes every frame on every connection it accepts.
    async fn echo_relay() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(frame)) = ws.next().await {
                        if frame.is_close() || ws.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[test]
    fn gate_skips_escape_sequences() {
        let mut gate = LineGate::default();
        for c in "\u{1b}[200~rm -rf /\u{1b}[201~\u{1b}OA\u{1b}[1;5Cx".chars() {
            gate.track(c);
        }
        assert_eq!(gate.line, "rm -rf /x");
        assert_eq!(gate.escape, Escape::Text);

        for c in "\u{7f}\u{7f}\u{1b}[D!".chars() {
            gate.track(c);
        }
        assert_eq!(gate.line, "rm -rf !");
    }

    #[tokio::test]
    async fn ping_answers_in_every_state() {
        let mut h = harness();
        let s = &h.session;

        s.route(Message::new("ping", "idle")).await;
        assert_eq!(next(&mut h.rx).await, Message::pong("idle"));

        connect(s).await;
        assert_eq!(s.state(), SessionState::Active);
        s.route(Message::new("ping", "active")).await;
        assert_eq!(next(&mut h.rx).await, Message::pong("active"));

        s.close().await;
        assert_eq!(s.state(), SessionState::Closed);
        s.route(Message::new("ping", "closed")).await;
        assert_eq!(next(&mut h.rx).await, Message::pong("closed"));
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn xterm_without_shell_produces_nothing() {
        let mut h = harness();
        h.session.route(Message::xterm("ls\r")).await;
        h.session.route(Message::new("ping", "")).await;
        assert_eq!(next(&mut h.rx).await, Message::pong(""));
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn connect_then_disconnect_emits_one_banner() {
        let mut h = harness();
        connect(&h.session).await;
        assert_eq!(h.session.state(), SessionState::Active);

        // a second connect while open is ignored
        connect(&h.session).await;
        assert_eq!(h.dialer.dial_count(), 1);

        h.session.route(Message::new("ssh/disconnect", "")).await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(next(&mut h.rx).await, Message::xterm(DISCONNECTED_BANNER));
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_interrupts_a_dial_in_progress() {
        let mut h = harness_with(EchoDialer::stalled(), None, Rules::default());
        h.session.route(Message::new("ssh/connect", "")).await;
        assert_eq!(h.session.state(), SessionState::Connecting);

        // the read side is not blocked by the dial
        h.session.route(Message::new("ping", "dialing")).await;
        assert_eq!(next(&mut h.rx).await, Message::pong("dialing"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.dialer.dial_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        h.session.route(Message::new("ssh/disconnect", "")).await;
        assert_eq!(next(&mut h.rx).await, Message::xterm(DISCONNECTED_BANNER));
        settle(&h.session).await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.shell().state(), BridgeState::Closed);

        // an abandoned attempt is not reported as a failure
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_interrupts_a_dial_in_progress() {
        let h = harness_with(EchoDialer::stalled(), None, Rules::default());
        h.session.route(Message::new("ssh/connect", "")).await;
        h.session.close().await;
        assert_eq!(h.session.state(), SessionState::Closed);
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.session.shell().state() != BridgeState::Closed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn input_reaches_open_shell_and_output_comes_back() {
        let mut h = harness();
        connect(&h.session).await;
        h.session.route(Message::xterm("echo hi\r")).await;
        assert_eq!(next(&mut h.rx).await, Message::xterm("echo hi\r"));
        assert_eq!(wait_received(&h.dialer, 1).await, vec!["echo hi\r"]);
    }

    #[tokio::test]
    async fn proxy_dial_failure_never_opens_shell() {
        let port = dead_port().await;
        let mut h = harness_with(EchoDialer::default(), Some(port), Rules::default());

        h.session.route(Message::new("ssh/connect", "")).await;
        let reply = next(&mut h.rx).await;
        assert!(reply.is("fatal"));
        assert!(reply.payload.starts_with("[ERROR]"));
        settle(&h.session).await;
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.dialer.dial_count(), 0);
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn shell_dial_failure_is_fatal_and_retryable() {
        let mut h = harness_with(EchoDialer::failing(), None, Rules::default());
        h.session.route(Message::new("ssh/connect", "")).await;
        assert!(next(&mut h.rx).await.is("fatal"));
        settle(&h.session).await;
        assert_eq!(h.session.state(), SessionState::Idle);

        h.session.route(Message::new("ssh/connect", "")).await;
        assert!(next(&mut h.rx).await.is("fatal"));
        assert_eq!(h.dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn shell_death_degrades_to_idle() {
        let h = harness();
        connect(&h.session).await;
        h.dialer.kill_all();
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.session.state() == SessionState::Active {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn shell_death_stops_the_proxy_too() {
        let port = echo_relay().await;
        let h = harness_with(EchoDialer::default(), Some(port), Rules::default());
        connect(&h.session).await;
        let proxy = h.session.proxy().unwrap();
        assert!(proxy.is_open());

        h.dialer.kill_all();
        tokio::time::timeout(Duration::from_secs(2), async {
            while proxy.state() != BridgeState::Closed || h.session.state() != SessionState::Idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("proxy outlived the shell");

        connect(&h.session).await;
        assert_eq!(h.session.state(), SessionState::Active);
        assert!(proxy.is_open());
        assert_eq!(h.dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn unrouted_channels_go_to_the_open_proxy() {
        let port = echo_relay().await;
        let mut h = harness_with(EchoDialer::default(), Some(port), Rules::default());

        // nowhere to go yet
        h.session.route(Message::new("relay/notice", "early")).await;
        connect(&h.session).await;

        h.session.route(Message::new("relay/notice", "hello")).await;
        assert_eq!(
            next_on(&mut h.rx, "relay/notice").await,
            Message::new("relay/notice", "hello")
        );
        h.session.close().await;
    }

    #[tokio::test]
    async fn resize_updates_shell_size() {
        let h = harness();
        h.session
            .route(Message::new("terminal/resize", r#"{"cols":100,"rows":30}"#))
            .await;
        assert_eq!(
            h.session.shell().terminal_size(),
            TerminalSize { cols: 100, rows: 30 }
        );
        h.session
            .route(Message::new("terminal/resize", "garbage"))
            .await;
        assert_eq!(h.session.shell().terminal_size().cols, 100);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unregisters() {
        let h = harness();
        h.session.register().await;
        assert_eq!(h.pool.size().await, 1);

        let (a, b) = (Arc::clone(&h.session), Arc::clone(&h.session));
        tokio::join!(a.close(), b.close());

        assert_eq!(h.pool.size().await, 0);
        assert!(h.session.cancel_token().is_cancelled());
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn register_announces_session_id() {
        let mut h = harness();
        h.session.register().await;
        let msg = next(&mut h.rx).await;
        assert_eq!(msg, Message::new("id", h.session.id()));
    }

    #[tokio::test]
    async fn teardown_stops_shell_before_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dialer = EchoDialer::default();
        let events = Arc::clone(&dialer.events);
        let server_events = Arc::clone(&events);
        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let WsMessage::Close(_) = frame {
                    server_events.lock().unwrap().push("proxy-closed");
                    break;
                }
                let _ = ws.send(frame).await;
            }
        });

        let h = harness_with(dialer, Some(port), Rules::default());
        connect(&h.session).await;
        assert_eq!(h.session.state(), SessionState::Active);
        assert!(h.session.proxy().unwrap().is_open());

        h.session.close().await;
        relay.await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["shell-closed", "proxy-closed"]);
    }

    #[tokio::test]
    async fn blocked_line_never_reaches_shell_enter() {
        let rules = Rules {
            block: vec!["rm -rf".to_string()],
            prompt: vec![],
        };
        let mut h = harness_with(EchoDialer::default(), None, rules);
        connect(&h.session).await;

        h.session.route(Message::xterm("rm -rf /\r")).await;
        let notice = next_on(&mut h.rx, "rules/blocked").await;
        assert!(notice.payload.contains("rm -rf"));
        assert_eq!(wait_received(&h.dialer, 1).await, vec!["rm -rf /\u{15}"]);
    }

    #[tokio::test]
    async fn bracketed_paste_is_still_checked() {
        let rules = Rules {
            block: vec!["rm -rf".to_string()],
            prompt: vec![],
        };
        let mut h = harness_with(EchoDialer::default(), None, rules);
        connect(&h.session).await;

        h.session
            .route(Message::xterm("\u{1b}[200~rm -rf /\u{1b}[201~"))
            .await;
        h.session.route(Message::xterm("\r")).await;
        let notice = next_on(&mut h.rx, "rules/blocked").await;
        let notice: serde_json::Value = serde_json::from_str(&notice.payload).unwrap();
        assert_eq!(notice["line"], "rm -rf /");
        assert_eq!(
            wait_received(&h.dialer, 2).await,
            vec!["\u{1b}[200~rm -rf /\u{1b}[201~", "\u{15}"]
        );
    }

    #[tokio::test]
    async fn prompted_line_waits_for_confirm() {
        let mut h = harness_with(EchoDialer::default(), None, prompt_rules("reboot"));
        connect(&h.session).await;

        h.session.route(Message::xterm("sudo reboot\r")).await;
        next_on(&mut h.rx, "rules/prompt").await;
        assert_eq!(wait_received(&h.dialer, 1).await, vec!["sudo reboot"]);

        h.session.route(Message::new("rules/confirm", "")).await;
        assert_eq!(wait_received(&h.dialer, 2).await, vec!["sudo reboot", "\r"]);

        // nothing held any more
        h.session.route(Message::new("rules/confirm", "")).await;
        h.session.route(Message::new("ping", "")).await;
        assert_eq!(next_on(&mut h.rx, "pong").await, Message::pong(""));
        assert_eq!(h.dialer.received().len(), 2);
    }

    #[tokio::test]
    async fn input_after_a_held_enter_is_released_on_confirm() {
        let mut h = harness_with(EchoDialer::default(), None, prompt_rules("reboot"));
        connect(&h.session).await;

        h.session.route(Message::xterm("reboot\rls\r")).await;
        next_on(&mut h.rx, "rules/prompt").await;
        assert_eq!(wait_received(&h.dialer, 1).await, vec!["reboot"]);

        h.session.route(Message::new("rules/confirm", "")).await;
        assert_eq!(
            wait_received(&h.dialer, 3).await,
            vec!["reboot", "\r", "ls\r"]
        );
    }

    #[tokio::test]
    async fn other_input_discards_hold_but_keeps_line() {
        let mut h = harness_with(EchoDialer::default(), None, prompt_rules("reboot"));
        connect(&h.session).await;

        h.session.route(Message::xterm("reboot\r")).await;
        next_on(&mut h.rx, "rules/prompt").await;

        // typing more re-arms the check on the full line
        h.session.route(Message::xterm(" now\r")).await;
        let notice = next_on(&mut h.rx, "rules/prompt").await;
        assert!(notice.payload.contains("reboot now"));
        h.session.route(Message::new("ping", "")).await;
        next_on(&mut h.rx, "pong").await;
        assert!(!h.dialer.received().iter().any(|chunk| chunk.contains('\r')));
    }

    #[tokio::test]
    async fn transcript_needs_a_container_id() {
        let h = harness();
        let entry = Message::new("term/message", r#"{"text":"ls","cwd":"/"}"#);

        h.session.inspect_reply(&entry).await;
        assert!(h.transcript.history("c1").await.is_empty());

        h.session
            .inspect_reply(&Message::new("client/containerID", "c1"))
            .await;
        assert_eq!(h.session.correlation_id().await.as_deref(), Some("c1"));
        h.session.inspect_reply(&entry).await;
        h.session
            .inspect_reply(&Message::new("term/message", "not json"))
            .await;

        let history = h.transcript.history("c1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["text"], "ls");
    }
}
