//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TERMGATE_LISTEN`, `TERMGATE_WORKERS`
//!    (comma-separated hosts), `TERMGATE_SSH_USER`, `TERMGATE_SSH_PASSWORD`
//! 2. **Config file**: path via `--config <path>`, or `termgate.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//! read_limit = 512          # max inbound frame size in bytes
//! write_wait_secs = 15
//! pong_wait_secs = 60
//!
//! [workers]
//! hosts = ["10.0.0.11", "10.0.0.12"]
//! runtime_port = 2375
//!
//! [ssh]
//! user = "clouseau"
//! password = "secret"
//! port = 2224
//!
//! [proxy]
//! enabled = true
//! port = 6010
//! path = "/websocket"
//!
//! [rules]
//! block = ["rm -rf /"]
//! prompt = ["shutdown"]
//!
//! [logging]
//! level = "info"
//! trace = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::rules::Rules;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Initial block/prompt rule lists.
    #[serde(default)]
    pub rules: Rules,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and per-connection socket settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum size in bytes of one inbound client frame (default 512).
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
    /// Deadline for a single socket write (default 15s).
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    /// Read deadline, refreshed on every received frame (default 60s).
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    /// Allow cross-origin requests on the admin routes (default true).
    #[serde(default = "default_cors")]
    pub cors: bool,
}

/// Backend worker hosts. Each must be reachable for SSH, the worker relay and
/// the container runtime API.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Container runtime API port on every worker (default 2375).
    #[serde(default = "default_runtime_port")]
    pub runtime_port: u16,
}

/// Credentials and port for the outbound shell sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// SSH port on the worker host (default 2224).
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// `TERM` value for the remote PTY (default `xterm-256color`).
    #[serde(default = "default_term")]
    pub term: String,
}

/// Downstream worker relay reached alongside every shell session.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Dial the worker relay on `ssh/connect` (default true).
    #[serde(default = "default_proxy_enabled")]
    pub enabled: bool,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_proxy_path")]
    pub path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log every relayed message at trace level (default false).
    #[serde(default)]
    pub trace: bool,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_read_limit() -> usize {
    512
}
fn default_write_wait_secs() -> u64 {
    15
}
fn default_pong_wait_secs() -> u64 {
    60
}
fn default_cors() -> bool {
    true
}
fn default_runtime_port() -> u16 {
    2375
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_ssh_port() -> u16 {
    2224
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_proxy_enabled() -> bool {
    true
}
fn default_proxy_port() -> u16 {
    6010
}
fn default_proxy_path() -> String {
    "/websocket".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_limit: default_read_limit(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            cors: default_cors(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            runtime_port: default_runtime_port(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            password: String::new(),
            port: default_ssh_port(),
            term: default_term(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: default_proxy_enabled(),
            port: default_proxy_port(),
            path: default_proxy_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            trace: false,
        }
    }
}

impl ServerConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keep-alive ping period. Must be less than the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `termgate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("termgate.toml").exists() => Self::from_file("termgate.toml")?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {path}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file {path}: {e}"))
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("TERMGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(workers) = lookup("TERMGATE_WORKERS") {
            self.workers.hosts = workers
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(user) = lookup("TERMGATE_SSH_USER") {
            self.ssh.user = user;
        }
        if let Some(password) = lookup("TERMGATE_SSH_PASSWORD") {
            self.ssh.password = password;
        }
    }
}
