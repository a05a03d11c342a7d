#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termgate
//!
//! Browser terminal gateway. Each browser WebSocket becomes a session that,
//! on `ssh/connect`, opens an SSH shell and a relay link on one worker host
//! and merges both back into the browser's reply stream.
//!
//! ## Subcommands
//!
//! - `termgate serve [--config <path>]` (default): run the HTTP/WS server
//!
//! See [`termgate::routes`] for the HTTP surface and [`termgate::ws`] for the
//! socket protocol.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use termgate::bridge::SshDialer;
use termgate::{AppState, Config, Pool, WorkerPool};

/// Browser terminal gateway.
#[derive(Parser)]
#[command(name = "termgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    match run_server(config_path.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("termgate: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    let level = if config.logging.trace {
        "trace".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("termgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    // Without workers there is nothing to relay to
    let workers = WorkerPool::connect(&config.workers.hosts, config.workers.runtime_port)
        .map_err(|e| format!("Failed to build worker pool: {e}"))?;
    for (idx, worker) in workers.workers().iter().enumerate() {
        info!(idx, host = %worker.host, runtime = %worker.runtime.endpoint(), "Worker registered");
    }
    check_runtimes(&workers, config.server.write_wait()).await;
    if config.ssh.password.is_empty() {
        warn!("No SSH password configured; set TERMGATE_SSH_PASSWORD or [ssh] password");
    }
    if !config.proxy.enabled {
        info!("Worker relay disabled, sessions open the shell only");
    }

    let pool = Pool::spawn();
    let dialer = Arc::new(SshDialer::new(config.server.write_wait()));
    let listen = config.server.listen.clone();
    let state = AppState::new(config, workers, pool, dialer);
    let app = termgate::router(state.clone());

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| format!("Failed to bind {listen}: {e}"))?;
    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {e}"))?;

    info!("Shutting down...");
    // sessions notice their sockets closing; give the pool a moment to drain
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while state.pool.size().await > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            sessions = state.pool.size().await,
            "Sessions still registered at exit"
        );
    }
    info!("Goodbye");
    Ok(())
}

/// Ping every worker's container runtime once. Failures are logged only:
/// the runtime is needed for container listings, not for terminals.
async fn check_runtimes(workers: &WorkerPool, deadline: Duration) {
    let checks = workers.workers().iter().enumerate().map(|(idx, worker)| async move {
        match tokio::time::timeout(deadline, worker.runtime.ping()).await {
            Ok(Ok(true)) => debug!(idx, host = %worker.host, "Container runtime reachable"),
            Ok(Ok(false)) => warn!(idx, host = %worker.host, "Container runtime answered ping with an error status"),
            Ok(Err(e)) => warn!(idx, host = %worker.host, "Container runtime unreachable: {e}"),
            Err(_) => warn!(idx, host = %worker.host, "Container runtime ping timed out"),
        }
    });
    futures::future::join_all(checks).await;
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
