//! Worker pool: the ordered, fixed-at-startup list of backend hosts.
//!
//! Sessions are pinned to a worker by the index in the upgrade path
//! (`/ws/{idx}`). The pool is read-only after construction, so it is shared
//! behind a plain `Arc` with no locking.

use serde::Serialize;
use thiserror::Error;

use crate::runtime::{RuntimeClient, RuntimeError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker index {index} out of range (pool has {count} workers)")]
    OutOfRange { index: usize, count: usize },
    #[error("no worker hosts configured")]
    Empty,
    #[error("worker {host}: {source}")]
    Runtime {
        host: String,
        #[source]
        source: RuntimeError,
    },
}

/// One backend host and its runtime API client.
#[derive(Debug, Clone)]
pub struct Worker {
    pub host: String,
    pub runtime: RuntimeClient,
}

/// Live session count for one worker, for `/docker/nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerLoad {
    #[serde(rename = "i")]
    pub idx: usize,
    pub host: String,
    pub clients: usize,
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Build a runtime client for every host. Any failure aborts the whole
    /// pool; there is no partial pool.
    pub fn connect(hosts: &[String], runtime_port: u16) -> Result<Self, WorkerError> {
        if hosts.is_empty() {
            return Err(WorkerError::Empty);
        }
        let workers = hosts
            .iter()
            .map(|host| {
                RuntimeClient::new(host, runtime_port)
                    .map(|runtime| Worker {
                        host: host.clone(),
                        runtime,
                    })
                    .map_err(|source| WorkerError::Runtime {
                        host: host.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn resolve(&self, index: usize) -> Result<&Worker, WorkerError> {
        self.workers.get(index).ok_or(WorkerError::OutOfRange {
            index,
            count: self.workers.len(),
        })
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Count sessions per worker host from a pool snapshot of
    /// `(session_id, host)` pairs. Diagnostic only; never used for routing.
    pub fn live_sessions_per_host(&self, sessions: &[(String, String)]) -> Vec<WorkerLoad> {
        self.workers
            .iter()
            .enumerate()
            .map(|(idx, worker)| WorkerLoad {
                idx,
                host: worker.host.clone(),
                clients: sessions.iter().filter(|(_, h)| *h == worker.host).count(),
            })
            .collect()
    }
}
