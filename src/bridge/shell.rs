//! Shell bridge: one outbound interactive shell on the worker host.
//!
//! The transport is produced by a [`ShellDialer`]. Once dialed it is just a
//! pair of byte queues plus a close token, so the bridge never sees SSH
//! directly. [`SshDialer`] is the production dialer (russh, password auth, PTY
//! plus shell on a session channel).
//!
//! Terminal size lives in a `watch` cell. Resizing only updates the cell; the
//! transport picks up the new geometry before its next write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{BridgeError, BridgeState, StateCell};
use crate::config::SshConfig;
use crate::message::{Message, TerminalSize};

const INPUT_CAPACITY: usize = 64;
const OUTPUT_CAPACITY: usize = 64;
/// Upper bound on waiting for transport tasks during `stop`.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Where and as whom to open the shell.
#[derive(Debug, Clone)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub term: String,
}

impl ShellTarget {
    pub fn new(host: &str, ssh: &SshConfig) -> Self {
        Self {
            host: host.to_string(),
            port: ssh.port,
            user: ssh.user.clone(),
            password: ssh.password.clone(),
            term: ssh.term.clone(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A dialed shell. Input written to `input` reaches the remote shell; remote
/// stdout/stderr arrives on `output`. Cancelling `closer` tears the transport
/// down, after which `output` yields `None`.
pub struct ShellTransport {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub closer: CancellationToken,
    pub driver: Option<JoinHandle<()>>,
}

#[async_trait]
pub trait ShellDialer: Send + Sync {
    /// Open a shell on `target`. `size` is the session's terminal geometry;
    /// the transport must apply changes to it before the next write.
    async fn dial(
        &self,
        target: &ShellTarget,
        size: watch::Receiver<TerminalSize>,
    ) -> Result<ShellTransport, BridgeError>;
}

/// russh-backed dialer.
#[derive(Debug, Clone)]
pub struct SshDialer {
    connect_timeout: Duration,
}

impl SshDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// Worker hosts are addressed by operator-configured IPs on a private
/// network; host keys are logged, not pinned.
struct WorkerHostKey;

#[async_trait]
impl client::Handler for WorkerHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(fingerprint = %server_public_key.fingerprint(), "Worker host key");
        Ok(true)
    }
}

#[async_trait]
impl ShellDialer for SshDialer {
    async fn dial(
        &self,
        target: &ShellTarget,
        mut size: watch::Receiver<TerminalSize>,
    ) -> Result<ShellTransport, BridgeError> {
        let addr = target.addr();
        let dial_err = |message: String| BridgeError::Dial {
            target: addr.clone(),
            message,
        };

        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, addr.as_str(), WorkerHostKey),
        )
        .await
        .map_err(|_| dial_err("connection timed out".to_string()))?
        .map_err(|e| dial_err(e.to_string()))?;

        let authenticated = handle
            .authenticate_password(target.user.clone(), target.password.clone())
            .await
            .map_err(|e| dial_err(e.to_string()))?;
        if !authenticated {
            return Err(BridgeError::Auth {
                target: addr.clone(),
            });
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| BridgeError::Channel(e.to_string()))?;
        let initial = *size.borrow_and_update();
        channel
            .request_pty(false, &target.term, initial.cols, initial.rows, 0, 0, &[])
            .await
            .map_err(|e| BridgeError::Channel(format!("pty request: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| BridgeError::Channel(format!("shell request: {e}")))?;
        debug!(addr = %addr, cols = initial.cols, rows = initial.rows, "SSH shell opened");

        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let closer = CancellationToken::new();
        let driver = tokio::spawn(drive_ssh(
            handle,
            channel,
            input_rx,
            output_tx,
            size,
            closer.clone(),
        ));

        Ok(ShellTransport {
            input: input_tx,
            output: output_rx,
            closer,
            driver: Some(driver),
        })
    }
}

/// Owns the SSH channel: writes queued input, forwards remote output, and
/// applies pending window changes ahead of each write.
async fn drive_ssh(
    handle: client::Handle<WorkerHostKey>,
    mut channel: russh::Channel<client::Msg>,
    mut input: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<Vec<u8>>,
    mut size: watch::Receiver<TerminalSize>,
    closer: CancellationToken,
) {
    loop {
        tokio::select! {
            () = closer.cancelled() => break,
            data = input.recv() => {
                let Some(data) = data else { break };
                if size.has_changed().unwrap_or(false) {
                    let s = *size.borrow_and_update();
                    if let Err(e) = channel.window_change(s.cols, s.rows, 0, 0).await {
                        debug!("Window change failed: {e}");
                    }
                }
                if let Err(e) = channel.data(&data[..]).await {
                    warn!("SSH write failed: {e}");
                    break;
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("SSH disconnect: {e}");
    }
}

struct ShellLink {
    input: mpsc::Sender<Vec<u8>>,
    closer: CancellationToken,
    /// Fired by the output pump when it exits, for any reason.
    ended: CancellationToken,
    pump: JoinHandle<()>,
    driver: Option<JoinHandle<()>>,
}

impl ShellLink {
    async fn shutdown(self) {
        self.closer.cancel();
        if let Some(driver) = self.driver {
            if tokio::time::timeout(STOP_GRACE, driver).await.is_err() {
                warn!("Shell transport did not stop in time");
            }
        }
        let _ = tokio::time::timeout(STOP_GRACE, self.pump).await;
    }
}

/// One session's shell. Starts `Closed`; see the module docs for the
/// lifecycle.
pub struct ShellBridge {
    label: String,
    target: ShellTarget,
    dialer: Arc<dyn ShellDialer>,
    replies: mpsc::Sender<Message>,
    state: Arc<StateCell>,
    size: watch::Sender<TerminalSize>,
    link: Mutex<Option<ShellLink>>,
    trace: bool,
}

impl ShellBridge {
    pub fn new(
        label: String,
        target: ShellTarget,
        dialer: Arc<dyn ShellDialer>,
        replies: mpsc::Sender<Message>,
        trace: bool,
    ) -> Self {
        let (size, _) = watch::channel(TerminalSize::default());
        Self {
            label,
            target,
            dialer,
            replies,
            state: Arc::new(StateCell::default()),
            size,
            link: Mutex::new(None),
            trace,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == BridgeState::Open
    }

    pub fn terminal_size(&self) -> TerminalSize {
        *self.size.borrow()
    }

    /// Record a new terminal size. Takes effect on the next write.
    pub fn resize(&self, size: TerminalSize) {
        self.size.send_replace(size);
    }

    /// Dial the shell and start pumping its output into the reply queue.
    ///
    /// No-op unless `Closed`. A dial failure is returned to the caller and
    /// leaves the bridge `Closed`. `cancel` bounds both the dial and the output
    /// pump.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        if !self
            .state
            .transition(BridgeState::Closed, BridgeState::Connecting)
        {
            debug!(label = %self.label, state = ?self.state.get(), "Shell start ignored");
            return Ok(());
        }

        let dialed = tokio::select! {
            () = cancel.cancelled() => Err(BridgeError::Closed),
            result = self.dialer.dial(&self.target, self.size.subscribe()) => result,
        };
        let transport = match dialed {
            Ok(transport) => transport,
            Err(e) => {
                self.state
                    .transition(BridgeState::Connecting, BridgeState::Closed);
                return Err(e);
            }
        };

        let ShellTransport {
            input,
            output,
            closer,
            driver,
        } = transport;
        let mut link = self.link.lock().await;
        if !self
            .state
            .transition(BridgeState::Connecting, BridgeState::Open)
        {
            // stopped while dialing
            drop(link);
            closer.cancel();
            if let Some(driver) = driver {
                let _ = tokio::time::timeout(STOP_GRACE, driver).await;
            }
            return Err(BridgeError::Closed);
        }
        if let Some(stale) = link.take() {
            stale.closer.cancel();
        }
        let ended = CancellationToken::new();
        let pump = tokio::spawn(pump_output(
            self.label.clone(),
            output,
            self.replies.clone(),
            Arc::clone(&self.state),
            cancel.clone(),
            closer.clone(),
            ended.clone(),
            self.trace,
        ));
        *link = Some(ShellLink {
            input,
            closer,
            ended,
            pump,
            driver,
        });
        info!(label = %self.label, addr = %self.target.addr(), "Shell bridge open");
        Ok(())
    }

    /// Token fired once the current transport's output pump has exited,
    /// whether through [`stop`](Self::stop) or the remote end going away.
    /// `None` when no transport was ever started.
    pub async fn ended(&self) -> Option<CancellationToken> {
        self.link.lock().await.as_ref().map(|link| link.ended.clone())
    }

    /// Close the transport. Returns whether the bridge was `Open`. Safe to
    /// call in any state and any number of times.
    pub async fn stop(&self) -> bool {
        let previous = self.state.replace(BridgeState::Closed);
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown().await;
        }
        if previous == BridgeState::Open {
            info!(label = %self.label, "Shell bridge closed");
        }
        previous == BridgeState::Open
    }

    /// Queue raw terminal input. Input while not `Open` is dropped.
    pub async fn send(&self, data: &str) -> bool {
        if !self.is_open() {
            trace!(label = %self.label, "Shell not open, input dropped: {data:?}");
            return false;
        }
        let input = match self.link.lock().await.as_ref() {
            Some(link) => link.input.clone(),
            None => return false,
        };
        if self.trace {
            trace!(label = %self.label, "Shell input: {data:?}");
        }
        input.send(data.as_bytes().to_vec()).await.is_ok()
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_output(
    label: String,
    mut output: mpsc::Receiver<Vec<u8>>,
    replies: mpsc::Sender<Message>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    closer: CancellationToken,
    ended: CancellationToken,
    trace: bool,
) {
    let mut decoder = Utf8Carry::default();
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            () = closer.cancelled() => break,
            chunk = output.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let text = decoder.decode(&chunk);
        if text.is_empty() {
            continue;
        }
        if trace {
            trace!(label = %label, "Shell output: {text:?}");
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            sent = replies.send(Message::xterm(text)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    if state.transition(BridgeState::Open, BridgeState::Closed) {
        info!(label = %label, "Shell transport ended");
    }
    ended.cancel();
}

/// Decodes a byte stream as UTF-8 across chunk boundaries. An incomplete
/// trailing sequence is held for the next chunk; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            let (valid, bad) = match std::str::from_utf8(&self.pending) {
                Ok(_) => (self.pending.len(), None),
                Err(e) => (e.valid_up_to(), Some(e.error_len())),
            };
            out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
            match bad {
                None => {
                    self.pending.clear();
                    break;
                }
                Some(None) => {
                    self.pending.drain(..valid);
                    break;
                }
                Some(Some(len)) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid + len);
                }
            }
        }
        out
    }
}
