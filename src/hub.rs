//! The synchronization engine.
//!
//! [`Hub`] owns the player store, the session registry and the broadcaster,
//! and is handed to every connection task, timer and the change-feed
//! propagator. Lock order is always sessions before store; no path holds the
//! store lock while taking the sessions lock.

use crate::auth::Authenticator;
use crate::error::{Result, SyncError};
use crate::fanout::Broadcaster;
use crate::game::{PlayerStore, SharedStore, UserId};
use crate::protocol::{decode_client_message, ClientMessage, ServerMessage};
use crate::records::{FieldChange, RecordStore, UserRecord};
use crate::session::{ConnectionId, SessionRegistry, SharedSessions, Sweep};
use axum::extract::ws::Message;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Tunables of the simulated world.
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// Distance covered per movement tick.
    pub step: f64,
    /// Where freshly created players appear.
    pub spawn: (f64, f64),
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            step: 5.0,
            spawn: (665.3, 322.4),
            outbound_buffer: 256,
        }
    }
}

/// Identity of the connection a message arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub conn: ConnectionId,
    pub identity: UserId,
    pub username: String,
}

/// Handed to the connection task after a successful join.
pub struct Joined {
    pub context: ConnectionContext,
    pub outbound: mpsc::Receiver<Message>,
    pub kill: Arc<Notify>,
}

/// Whether the connection should keep reading after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Hub {
    store: SharedStore,
    sessions: SharedSessions,
    fanout: Broadcaster,
    auth: Arc<dyn Authenticator>,
    records: Arc<dyn RecordStore>,
    settings: WorldSettings,
}

impl Hub {
    pub fn new(
        settings: WorldSettings,
        auth: Arc<dyn Authenticator>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let sessions: SharedSessions = Arc::new(RwLock::new(SessionRegistry::new()));
        Self {
            store: Arc::new(RwLock::new(PlayerStore::new())),
            fanout: Broadcaster::new(sessions.clone()),
            sessions,
            auth,
            records,
            settings,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn sessions(&self) -> &SharedSessions {
        &self.sessions
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    /// Verify the presented credential and fetch the caller's record.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserRecord> {
        let token = token.ok_or(SyncError::MissingCredential)?;
        let creds = self.auth.authenticate(token).await?;
        let record = self
            .records
            .find_user_by_username(&creds.username)
            .await?
            .ok_or_else(|| SyncError::UnknownUser(creds.username.clone()))?;
        if record.id != creds.identity {
            debug!(
                "Credential id {} differs from record id {} for {}",
                creds.identity, record.id, creds.username
            );
        }
        Ok(record)
    }

    /// Register a new connection for `record`'s identity, create or resume its
    /// player, queue the `init` snapshot for it and announce the join to
    /// everyone else.
    pub async fn join(&self, record: &UserRecord) -> Joined {
        let (tx, outbound) = mpsc::channel(self.settings.outbound_buffer);
        let kill = Arc::new(Notify::new());

        let (conn, announce) = {
            let mut sessions = self.sessions.write().await;
            let (conn, count) = sessions.register(record.id.clone(), tx, kill.clone());
            let mut store = self.store.write().await;
            let attach = store.attach(record, self.settings.spawn, count);

            // Queued while the registry is locked so no broadcast can reach
            // this connection ahead of its snapshot.
            let init = ServerMessage::Init {
                id: record.id.clone(),
                players: store.snapshot_all(),
            };
            match init.to_text() {
                Ok(text) => {
                    if let Some(c) = sessions.get(conn) {
                        if let Err(e) = c.try_send(Message::Text(text)) {
                            warn!("Could not queue init for {}: {}", conn, e);
                        }
                    }
                }
                Err(e) => error!("Failed to encode init for {}: {}", conn, e),
            }

            info!(
                "User {} ({}) joined on {}, {:?}, active tabs: {}",
                record.username, record.id, conn, attach, count
            );
            let announce = store
                .get(&record.id)
                .map(|p| ServerMessage::delta(record.id.clone(), p.movement_delta()));
            (conn, announce)
        };

        if let Some(msg) = announce {
            self.fanout.broadcast(&msg, Some(conn)).await;
        }

        Joined {
            context: ConnectionContext {
                conn,
                identity: record.id.clone(),
                username: record.username.clone(),
            },
            outbound,
            kill,
        }
    }

    /// Decode and dispatch one inbound text frame. Frames that do not decode
    /// are dropped and the connection stays open.
    pub async fn handle_text(&self, ctx: &ConnectionContext, text: &str) -> Flow {
        match decode_client_message(text) {
            Ok(msg) => self.handle_message(ctx, msg).await,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", ctx.conn, e);
                Flow::Continue
            }
        }
    }

    pub async fn handle_message(&self, ctx: &ConnectionContext, msg: ClientMessage) -> Flow {
        match msg {
            ClientMessage::SetTarget { target_x, target_y } => {
                self.set_target(ctx, target_x, target_y).await;
                Flow::Continue
            }
            ClientMessage::Chat { text } => {
                self.chat(ctx, text).await;
                Flow::Continue
            }
            ClientMessage::Disconnect => {
                self.disconnect(ctx).await;
                Flow::Close
            }
            ClientMessage::Unknown => Flow::Continue,
        }
    }

    /// Set the caller's target and send the delta to every other connection.
    /// Returns false when the identity has no live player.
    pub async fn set_target(&self, ctx: &ConnectionContext, x: f64, y: f64) -> bool {
        if !x.is_finite() || !y.is_finite() {
            debug!("Ignoring non-finite target from {}", ctx.conn);
            return false;
        }
        let delta = {
            let mut store = self.store.write().await;
            match store.set_target(&ctx.identity, x, y) {
                Some(player) => player.movement_delta(),
                None => return false,
            }
        };
        debug!("{} new target: x={:.1}, y={:.1}", ctx.username, x, y);
        self.fanout
            .broadcast(&ServerMessage::delta(ctx.identity.clone(), delta), Some(ctx.conn))
            .await;
        true
    }

    /// Relay a chat line to every connection, sender included.
    pub async fn chat(&self, ctx: &ConnectionContext, text: String) {
        let username = {
            let store = self.store.read().await;
            store
                .get(&ctx.identity)
                .map(|p| p.username.clone())
                .unwrap_or_else(|| ctx.username.clone())
        };
        self.fanout
            .broadcast(&ServerMessage::Chat { username, text }, None)
            .await;
    }

    /// Explicit logout: the player goes away at once, whatever other tabs the
    /// identity still has open.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        let removed = self.store.write().await.remove(&ctx.identity);
        if removed.is_some() {
            info!("Player {} logged out on {}", ctx.identity, ctx.conn);
            self.announce_removal(&ctx.identity).await;
        }
    }

    /// Connection closed for any reason. The player is removed only when this
    /// was the identity's last connection. Safe to call more than once.
    pub async fn leave(&self, conn: ConnectionId) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let Some((closed, remaining)) = sessions.unregister(conn) else {
                return;
            };
            let mut store = self.store.write().await;
            let lived = Utc::now() - closed.connected_at;
            info!(
                "{} for {} closed after {}s, remaining tabs: {}",
                conn,
                closed.identity,
                lived.num_seconds(),
                remaining
            );
            if remaining == 0 {
                store.remove(&closed.identity).map(|p| p.id)
            } else {
                store.set_connection_count(&closed.identity, remaining);
                None
            }
        };

        if let Some(id) = removed {
            info!("Player {} removed (last tab closed)", id);
            self.announce_removal(&id).await;
        }
    }

    async fn announce_removal(&self, id: &UserId) {
        self.fanout
            .broadcast(
                &ServerMessage::Remove {
                    player_id: id.clone(),
                },
                None,
            )
            .await;
    }

    /// Liveness acknowledgment received on `conn`.
    pub async fn mark_alive(&self, conn: ConnectionId) {
        if let Some(c) = self.sessions.read().await.get(conn) {
            c.mark_alive();
        }
    }

    /// One movement step for every player with a target. Does not broadcast.
    pub async fn tick(&self) -> usize {
        self.store.write().await.tick(self.settings.step)
    }

    /// One liveness cycle over every connection.
    pub async fn heartbeat_cycle(&self) -> Sweep {
        let sweep = self.sessions.read().await.sweep();
        for conn in &sweep.terminated {
            info!("Terminating dead socket {}", conn);
        }
        sweep
    }

    /// Broadcast every player's full state. Returns `None` when there are no
    /// players, otherwise how many connections accepted the frame.
    pub async fn reconcile(&self) -> Option<usize> {
        let snapshots = {
            let store = self.store.read().await;
            if store.is_empty() {
                return None;
            }
            store.snapshot_all()
        };
        Some(
            self.fanout
                .broadcast(&ServerMessage::snapshots(snapshots), None)
                .await,
        )
    }

    /// Fold an external record change into the store and tell every client.
    /// Returns whether a broadcast went out.
    pub async fn apply_external_change(&self, change: &FieldChange) -> bool {
        let delta = {
            let mut store = self.store.write().await;
            match store.apply_change(change) {
                Some(player) => player.attribute_delta(&change.change),
                None => {
                    debug!(
                        "Change {:?} for {} not broadcast, no live player or stale",
                        change.change.field(),
                        change.identity
                    );
                    return false;
                }
            }
        };
        self.fanout
            .broadcast(&ServerMessage::delta(change.identity.clone(), delta), None)
            .await;
        true
    }
}
