//! Wire messages exchanged with clients.
//!
//! Every frame is a UTF-8 JSON object with a `type` discriminator. Inbound
//! frames decode into the closed [`ClientMessage`] set; tags outside that set
//! land on [`ClientMessage::Unknown`] and are ignored by the handler.

use crate::game::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full authoritative state of one player.
///
/// Targets serialize as `null` when the player is idle so that a snapshot
/// also tells clients a previous target was cleared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub x: f64,
    pub y: f64,
    pub target_x: Option<f64>,
    pub target_y: Option<f64>,
    pub coins: i64,
    pub username: String,
    pub color: String,
}

/// Changed fields for one player. Absent fields are left untouched by clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coins: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlayerUpdate {
    Snapshot(PlayerSnapshot),
    Delta(PlayerDelta),
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full state plus the recipient's own identity; sent once per connection.
    Init {
        id: UserId,
        players: BTreeMap<UserId, PlayerSnapshot>,
    },
    Update {
        players: BTreeMap<UserId, PlayerUpdate>,
    },
    Remove {
        #[serde(rename = "playerId")]
        player_id: UserId,
    },
    Chat {
        username: String,
        text: String,
    },
}

impl ServerMessage {
    /// Update carrying a delta for a single player.
    pub fn delta(id: UserId, delta: PlayerDelta) -> Self {
        let mut players = BTreeMap::new();
        players.insert(id, PlayerUpdate::Delta(delta));
        ServerMessage::Update { players }
    }

    /// Update carrying full snapshots, used by reconciliation.
    pub fn snapshots(snapshots: BTreeMap<UserId, PlayerSnapshot>) -> Self {
        let players = snapshots
            .into_iter()
            .map(|(id, snap)| (id, PlayerUpdate::Snapshot(snap)))
            .collect();
        ServerMessage::Update { players }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent from clients to the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "setTarget", rename_all = "camelCase")]
    SetTarget { target_x: f64, target_y: f64 },
    #[serde(rename = "chat")]
    Chat { text: String },
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(other)]
    Unknown,
}

/// Decode one inbound text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}
