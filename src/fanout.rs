//! Best-effort delivery of server messages to open connections.

use crate::protocol::ServerMessage;
use crate::session::{ConnectionId, SharedSessions};
use axum::extract::ws::Message;
use tracing::{debug, error};

#[derive(Clone)]
pub struct Broadcaster {
    sessions: SharedSessions,
}

impl Broadcaster {
    pub fn new(sessions: SharedSessions) -> Self {
        Self { sessions }
    }

    /// Serialize once and queue on every connection except `exclude`.
    /// Returns how many connections accepted the frame.
    pub async fn broadcast(&self, msg: &ServerMessage, exclude: Option<ConnectionId>) -> usize {
        let text = match msg.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };
        self.broadcast_text(&text, exclude).await
    }

    /// Queue a pre-serialized frame. A full or closed queue only costs that
    /// one peer this one frame.
    pub async fn broadcast_text(&self, text: &str, exclude: Option<ConnectionId>) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for conn in sessions.iter() {
            if Some(conn.id) == exclude {
                continue;
            }
            match conn.try_send(Message::Text(text.to_owned())) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Dropped frame for {}: {}", conn.id, e),
            }
        }
        delivered
    }

    /// Queue a message for a single connection.
    pub async fn send_to(&self, id: ConnectionId, msg: &ServerMessage) -> bool {
        let text = match msg.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode message for {}: {}", id, e);
                return false;
            }
        };
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(conn) => conn.try_send(Message::Text(text)).is_ok(),
            None => false,
        }
    }
}
