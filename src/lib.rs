#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! termgate library: browser terminal gateway building blocks.
//!
//! - `message`: the `{channel, payload}` envelope and channel names
//! - `pool`: registry of live sessions (single dispatcher task)
//! - `workers`: backend hosts and their container runtime clients
//! - `bridge`: outbound shell (SSH) and worker relay (WebSocket) links
//! - `session`: per-connection state machine and message routing
//! - `ws`: WebSocket upgrade and socket pumps
//! - `rules`: block/prompt command rules
//! - `transcript`: per-container command history
//! - `routes`: HTTP handlers and router
//! - `config`: configuration loading

pub mod bridge;
pub mod config;
pub mod message;
pub mod pool;
pub mod routes;
pub mod rules;
pub mod runtime;
pub mod session;
pub mod state;
pub mod transcript;
pub mod workers;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use message::Message;
pub use pool::{Pool, PoolHandle};
pub use routes::router;
pub use session::Session;
pub use state::AppState;
pub use workers::WorkerPool;
