//! Outbound transports owned by a session.
//!
//! - `shell`: one interactive shell on the worker host (SSH in production).
//! - `proxy`: one WebSocket link to the worker's relay process.
//!
//! Both share the same lifecycle: `Closed -> Connecting -> Open -> Closed`,
//! tracked in a [`StateCell`] so every transition is a compare-and-swap and
//! `start`/`stop` can be called from any state without double-starting or
//! double-stopping.

pub mod proxy;
pub mod shell;

use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

pub use proxy::ProxyBridge;
pub use shell::{ShellBridge, ShellDialer, ShellTarget, ShellTransport, SshDialer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Closed = 0,
    Connecting = 1,
    Open = 2,
}

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Atomic holder for a [`BridgeState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(BridgeState::Closed as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> BridgeState {
        BridgeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to` only if the cell currently holds `from`.
    pub fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally store `to`, returning the previous state.
    pub fn replace(&self, to: BridgeState) -> BridgeState {
        BridgeState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("dial {target} failed: {message}")]
    Dial { target: String, message: String },
    #[error("authentication rejected by {target}")]
    Auth { target: String },
    #[error("channel setup failed: {0}")]
    Channel(String),
    #[error("bridge closed")]
    Closed,
}
