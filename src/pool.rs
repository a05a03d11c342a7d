//! Process-wide registry of live browser sessions.
//!
//! The member map is owned by a single dispatcher task ([`Pool::run`]). Every
//! other component talks to it through a cloneable [`PoolHandle`], which only
//! submits commands into the dispatcher's queue. Register, unregister and
//! delivery are therefore serialized and a broadcast always walks a consistent
//! member set.
//!
//! Delivery never writes to a socket directly: each member carries the
//! sending half of its session's outbound queue, and the session's writer task
//! owns the socket. Sends are non-blocking (`try_send`) so a stuck or departed
//! session cannot stall the dispatcher or starve the other recipients.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::message::{DirectMessage, Message};

/// Capacity of the dispatcher's command queue.
const POOL_QUEUE_CAPACITY: usize = 256;

/// A registered session as seen by the pool.
#[derive(Debug, Clone)]
pub struct PoolMember {
    pub id: String,
    /// Worker host this session's outbound links target.
    pub host: String,
    /// Outbound queue drained by the session's writer task.
    pub tx: mpsc::Sender<Message>,
}

enum PoolCommand {
    Register(PoolMember),
    Unregister(String),
    Direct(DirectMessage),
    Broadcast(Message),
    Size(oneshot::Sender<usize>),
    Snapshot(oneshot::Sender<Vec<(String, String)>>),
}

/// Submit side of the pool. Cloneable; all clones feed the same dispatcher.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolCommand>,
}

/// The dispatcher. Owns the member map; run it with [`Pool::run`].
pub struct Pool {
    members: HashMap<String, PoolMember>,
    rx: mpsc::Receiver<PoolCommand>,
}

impl Pool {
    /// Create a dispatcher and its handle. The dispatcher does nothing until
    /// [`Pool::run`] is spawned.
    pub fn channel() -> (Self, PoolHandle) {
        let (tx, rx) = mpsc::channel(POOL_QUEUE_CAPACITY);
        (
            Self {
                members: HashMap::new(),
                rx,
            },
            PoolHandle { tx },
        )
    }

    /// Spawn a dispatcher on the current runtime and return its handle.
    pub fn spawn() -> PoolHandle {
        let (pool, handle) = Self::channel();
        tokio::spawn(pool.run());
        handle
    }

    /// Dispatch loop. Returns once every [`PoolHandle`] has been dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                PoolCommand::Register(member) => self.register(member),
                PoolCommand::Unregister(id) => self.unregister(&id),
                PoolCommand::Direct(direct) => self.direct(direct),
                PoolCommand::Broadcast(msg) => self.broadcast(&msg),
                PoolCommand::Size(reply) => {
                    let _ = reply.send(self.members.len());
                }
                PoolCommand::Snapshot(reply) => {
                    let snapshot = self
                        .members
                        .values()
                        .map(|m| (m.id.clone(), m.host.clone()))
                        .collect();
                    let _ = reply.send(snapshot);
                }
            }
        }
        debug!("Pool dispatcher stopped");
    }

    fn register(&mut self, member: PoolMember) {
        if self.members.contains_key(&member.id) {
            warn!(session_id = %member.id, "Duplicate session registration rejected");
            return;
        }
        info!(session_id = %member.id, host = %member.host, size = self.members.len() + 1, "Session registered");
        self.members.insert(member.id.clone(), member);
    }

    fn unregister(&mut self, id: &str) {
        if self.members.remove(id).is_some() {
            info!(session_id = %id, size = self.members.len(), "Session unregistered");
        } else {
            debug!(session_id = %id, "Unregister for unknown session ignored");
        }
    }

    fn direct(&self, direct: DirectMessage) {
        for id in &direct.clients {
            // Target may have disconnected concurrently
            let Some(member) = self.members.get(id) else {
                debug!(session_id = %id, "Direct message for unknown session dropped");
                continue;
            };
            deliver(member, direct.message.clone());
        }
    }

    fn broadcast(&self, msg: &Message) {
        for member in self.members.values() {
            deliver(member, msg.clone());
        }
    }
}

fn deliver(member: &PoolMember, msg: Message) {
    if let Err(e) = member.tx.try_send(msg) {
        warn!(session_id = %member.id, "Pool delivery failed: {e}");
    }
}

impl PoolHandle {
    async fn submit(&self, cmd: PoolCommand) {
        if self.tx.send(cmd).await.is_err() {
            warn!("Pool dispatcher is gone, command dropped");
        }
    }

    pub async fn register(&self, member: PoolMember) {
        self.submit(PoolCommand::Register(member)).await;
    }

    pub async fn unregister(&self, id: &str) {
        self.submit(PoolCommand::Unregister(id.to_string())).await;
    }

    /// Deliver `message` to each listed session that is still registered.
    pub async fn direct(&self, message: Message, clients: Vec<String>) {
        self.submit(PoolCommand::Direct(DirectMessage { message, clients }))
            .await;
    }

    pub async fn broadcast(&self, message: Message) {
        self.submit(PoolCommand::Broadcast(message)).await;
    }

    /// Number of registered sessions. Returns 0 if the dispatcher is gone.
    pub async fn size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.submit(PoolCommand::Size(tx)).await;
        rx.await.unwrap_or(0)
    }

    /// `(session_id, host)` for every registered session.
    pub async fn snapshot(&self) -> Vec<(String, String)> {
        let (tx, rx) = oneshot::channel();
        self.submit(PoolCommand::Snapshot(tx)).await;
        rx.await.unwrap_or_default()
    }
}
