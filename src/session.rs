use crate::game::UserId;
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

pub type SharedSessions = Arc<RwLock<SessionRegistry>>;

/// Opaque handle for one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One live transport session attached to an identity.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: UserId,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Message>,
    alive: AtomicBool,
    kill: Arc<Notify>,
}

impl Connection {
    /// Queue a frame without waiting. Fails when the queue is full or the
    /// connection's writer has gone away.
    pub fn try_send(&self, msg: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.outbound.try_send(msg)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Ask the connection task to tear the socket down.
    pub fn terminate(&self) {
        self.kill.notify_one();
    }
}

/// Outcome of one heartbeat sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub pinged: Vec<ConnectionId>,
    pub terminated: Vec<ConnectionId>,
}

/// Maps identities to their live connections, collapsing tabs of one user
/// onto a single player.
#[derive(Default)]
pub struct SessionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    by_identity: HashMap<UserId, BTreeSet<ConnectionId>>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns its handle and the identity's live
    /// connection count including the new one.
    pub fn register(
        &mut self,
        identity: UserId,
        outbound: mpsc::Sender<Message>,
        kill: Arc<Notify>,
    ) -> (ConnectionId, usize) {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let conns = self.by_identity.entry(identity.clone()).or_default();
        conns.insert(id);
        let count = conns.len();
        self.connections.insert(
            id,
            Connection {
                id,
                identity,
                connected_at: Utc::now(),
                outbound,
                alive: AtomicBool::new(true),
                kill,
            },
        );
        (id, count)
    }

    /// Drop a connection. Returns it together with the identity's remaining
    /// connection count, or `None` if it was already gone.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<(Connection, usize)> {
        let conn = self.connections.remove(&id)?;
        let remaining = match self.by_identity.get_mut(&conn.identity) {
            Some(conns) => {
                conns.remove(&id);
                let n = conns.len();
                if n == 0 {
                    self.by_identity.remove(&conn.identity);
                }
                n
            }
            None => 0,
        };
        Some((conn, remaining))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self, identity: &UserId) -> usize {
        self.by_identity.get(identity).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// One liveness cycle: connections that acknowledged since the last
    /// cycle are pinged and flagged pending; ones still pending are
    /// terminated.
    pub fn sweep(&self) -> Sweep {
        let mut sweep = Sweep::default();
        for conn in self.connections.values() {
            if conn.alive.swap(false, Ordering::SeqCst) {
                if let Err(e) = conn.try_send(Message::Ping(Vec::new())) {
                    debug!("Ping to {} not queued: {}", conn.id, e);
                }
                sweep.pinged.push(conn.id);
            } else {
                conn.terminate();
                sweep.terminated.push(conn.id);
            }
        }
        sweep.pinged.sort();
        sweep.terminated.sort();
        sweep
    }
}
