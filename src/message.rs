//! The message envelope exchanged on every link of the relay.
//!
//! Every WebSocket frame (browser to gateway, gateway to worker relay) is a
//! JSON object with exactly two string fields:
//!
//! ```json
//! {"channel": "xterm", "payload": "ls -la\r"}
//! ```
//!
//! Structured sub-payloads (terminal resize, history entries) are themselves
//! JSON, encoded into the `payload` string. They are never nested objects.

use serde::{Deserialize, Serialize};

/// Channel names understood by the gateway.
pub mod channel {
    /// Raw terminal input (client → shell) or output (shell → client).
    pub const XTERM: &str = "xterm";
    /// Terminal geometry update, payload `{"cols":N,"rows":N}`.
    pub const RESIZE: &str = "terminal/resize";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SSH_CONNECT: &str = "ssh/connect";
    pub const SSH_DISCONNECT: &str = "ssh/disconnect";
    /// Unrecoverable failure for the requested operation.
    pub const FATAL: &str = "fatal";
    /// First message on every connection: the session ID.
    pub const ID: &str = "id";
    /// Sets the session's correlation (container) ID.
    pub const CONTAINER_ID: &str = "client/containerID";
    /// A completed command/output pair destined for the transcript.
    pub const TERM_MESSAGE: &str = "term/message";
    /// Input line rejected by a block rule.
    pub const RULES_BLOCKED: &str = "rules/blocked";
    /// Input line held pending confirmation by a prompt rule.
    pub const RULES_PROMPT: &str = "rules/prompt";
    /// Client confirms a held input line.
    pub const RULES_CONFIRM: &str = "rules/confirm";
}

/// Payload sent on `xterm` after an explicit `ssh/disconnect`.
pub const DISCONNECTED_BANNER: &str = "\r\n** Disconnected **\r\n";

/// A `{channel, payload}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn xterm(payload: impl Into<String>) -> Self {
        Self::new(channel::XTERM, payload)
    }

    pub fn fatal(payload: impl Into<String>) -> Self {
        Self::new(channel::FATAL, payload)
    }

    /// Reply to a `ping` carrying `payload`.
    pub fn pong(payload: &str) -> Self {
        Self::new(channel::PONG, format!("PONG {payload}"))
    }

    pub fn is(&self, channel: &str) -> bool {
        self.channel == channel
    }
}

/// A message addressed to an explicit set of session IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message: Message,
    pub clients: Vec<String>,
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Parse the double-encoded `terminal/resize` payload.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
