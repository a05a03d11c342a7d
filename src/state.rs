//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::proxy::ProxyTimings;
use crate::bridge::ShellDialer;
use crate::config::Config;
use crate::pool::PoolHandle;
use crate::rules::RuleSet;
use crate::session::SessionDeps;
use crate::transcript::MemoryTranscript;
use crate::workers::WorkerPool;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Submit side of the live-session pool.
    pub pool: PoolHandle,
    /// Backend hosts, fixed at startup.
    pub workers: Arc<WorkerPool>,
    /// Block/prompt rules consulted by every session.
    pub rules: Arc<RuleSet>,
    /// Per-container command history.
    pub transcript: Arc<MemoryTranscript>,
    /// Opens the outbound shell for each session.
    pub dialer: Arc<dyn ShellDialer>,
}

impl AppState {
    pub fn new(
        config: Config,
        workers: WorkerPool,
        pool: PoolHandle,
        dialer: Arc<dyn ShellDialer>,
    ) -> Self {
        let rules = Arc::new(RuleSet::new(config.rules.clone()));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            pool,
            workers: Arc::new(workers),
            rules,
            transcript: Arc::new(MemoryTranscript::new()),
            dialer,
        }
    }

    /// Collaborators for a new session.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            pool: self.pool.clone(),
            rules: Arc::clone(&self.rules),
            transcript: self.transcript.clone(),
            dialer: Arc::clone(&self.dialer),
            ssh: self.config.ssh.clone(),
            proxy: self.config.proxy.clone(),
            timings: ProxyTimings::from(&self.config.server),
            trace: self.config.logging.trace,
        }
    }
}
