use crate::protocol::{PlayerDelta, PlayerSnapshot};
use crate::records::{AttributeChange, FieldChange, UserRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared store alias used by every component that reads or moves players.
pub type SharedStore = Arc<RwLock<PlayerStore>>;

/// Stable user identity, equal to the record store's user id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: UserId,
    pub x: f64,
    pub y: f64,
    pub target: Option<Target>,
    pub username: String,
    pub color: String,
    pub coins: i64,
    /// Record-store revision the current `coins` value came from.
    pub coins_revision: u64,
    pub connection_count: usize,
}

impl Player {
    /// Move one step toward the pending target.
    ///
    /// Snaps onto the target and clears it once the remaining distance is no
    /// more than `step`; otherwise advances exactly `step` along the straight
    /// line, so the distance strictly shrinks and never overshoots.
    /// Returns whether the player moved.
    pub fn advance(&mut self, step: f64) -> bool {
        let Some(target) = self.target else {
            return false;
        };
        let dx = target.x - self.x;
        let dy = target.y - self.y;
        let dist = dx.hypot(dy);

        if dist <= step {
            self.x = target.x;
            self.y = target.y;
            self.target = None;
        } else {
            self.x += dx / dist * step;
            self.y += dy / dist * step;
        }
        true
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            x: self.x,
            y: self.y,
            target_x: self.target.map(|t| t.x),
            target_y: self.target.map(|t| t.y),
            coins: self.coins,
            username: self.username.clone(),
            color: self.color.clone(),
        }
    }

    /// Delta announcing a join or a new target.
    pub fn movement_delta(&self) -> PlayerDelta {
        PlayerDelta {
            x: Some(self.x),
            y: Some(self.y),
            target_x: self.target.map(|t| t.x),
            target_y: self.target.map(|t| t.y),
            coins: Some(self.coins),
            username: Some(self.username.clone()),
            color: Some(self.color.clone()),
        }
    }

    /// Delta for an externally changed attribute: the changed field plus
    /// username and position.
    pub fn attribute_delta(&self, change: &AttributeChange) -> PlayerDelta {
        let mut delta = PlayerDelta {
            x: Some(self.x),
            y: Some(self.y),
            username: Some(self.username.clone()),
            ..PlayerDelta::default()
        };
        match change {
            AttributeChange::Coins(coins) => delta.coins = Some(*coins),
            AttributeChange::Color(color) => delta.color = Some(color.clone()),
            AttributeChange::Username(_) => {}
        }
        delta
    }
}

/// Whether an attach created a fresh player or resumed a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Created,
    Resumed,
}

/// In-memory table of authoritative player state, keyed by identity.
#[derive(Debug, Default)]
pub struct PlayerStore {
    players: HashMap<UserId, Player>,
    /// Newest coin value seen on the change feed per identity, live or not.
    observed_coins: HashMap<UserId, (u64, i64)>,
}

impl PlayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn get(&self, id: &UserId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.players.contains_key(id)
    }

    /// Attach a connection's identity, creating the player at `spawn` or
    /// resuming the live one. Display attributes are refreshed from the
    /// record; position and target of a resumed player are kept.
    pub fn attach(
        &mut self,
        record: &UserRecord,
        spawn: (f64, f64),
        connection_count: usize,
    ) -> Attach {
        let (coins_revision, coins) = self.freshest_coins(record);

        if let Some(player) = self.players.get_mut(&record.id) {
            player.username = record.username.clone();
            player.color = record.color.clone();
            if coins_revision >= player.coins_revision {
                player.coins = coins;
                player.coins_revision = coins_revision;
            }
            player.connection_count = connection_count;
            debug!(
                "Resumed player {} at ({:.1}, {:.1}) with {} connections",
                record.id, player.x, player.y, connection_count
            );
            return Attach::Resumed;
        }

        self.players.insert(
            record.id.clone(),
            Player {
                id: record.id.clone(),
                x: spawn.0,
                y: spawn.1,
                target: None,
                username: record.username.clone(),
                color: record.color.clone(),
                coins,
                coins_revision,
                connection_count,
            },
        );
        info!("Created player {} ({})", record.id, record.username);
        Attach::Created
    }

    fn freshest_coins(&self, record: &UserRecord) -> (u64, i64) {
        match self.observed_coins.get(&record.id) {
            Some(&(rev, coins)) if rev > record.revision => (rev, coins),
            _ => (record.revision, record.coins),
        }
    }

    pub fn set_connection_count(&mut self, id: &UserId, count: usize) {
        if let Some(player) = self.players.get_mut(id) {
            player.connection_count = count;
        }
    }

    pub fn remove(&mut self, id: &UserId) -> Option<Player> {
        self.players.remove(id)
    }

    /// Set a pending target. Returns the updated player, or `None` when the
    /// identity has no live player.
    pub fn set_target(&mut self, id: &UserId, x: f64, y: f64) -> Option<&Player> {
        let player = self.players.get_mut(id)?;
        player.target = Some(Target { x, y });
        Some(player)
    }

    /// Advance every player with a pending target by one step.
    /// Returns how many players moved.
    pub fn tick(&mut self, step: f64) -> usize {
        self.players
            .values_mut()
            .map(|p| p.advance(step))
            .filter(|moved| *moved)
            .count()
    }

    pub fn snapshot_all(&self) -> BTreeMap<UserId, PlayerSnapshot> {
        self.players
            .iter()
            .map(|(id, p)| (id.clone(), p.snapshot()))
            .collect()
    }

    /// Fold an external record change into the store.
    ///
    /// Coin changes are remembered even without a live player so a later
    /// attach never regresses to an older value. Returns the player when a
    /// live one was updated and clients should hear about it.
    pub fn apply_change(&mut self, change: &FieldChange) -> Option<&Player> {
        if let AttributeChange::Coins(coins) = change.change {
            let newer = self
                .observed_coins
                .get(&change.identity)
                .map_or(true, |&(rev, _)| change.revision > rev);
            if newer {
                self.observed_coins
                    .insert(change.identity.clone(), (change.revision, coins));
            }
        }

        let player = self.players.get_mut(&change.identity)?;
        match &change.change {
            AttributeChange::Coins(coins) => {
                if change.revision <= player.coins_revision {
                    return None;
                }
                player.coins = *coins;
                player.coins_revision = change.revision;
            }
            AttributeChange::Color(color) => player.color = color.clone(),
            AttributeChange::Username(name) => player.username = name.clone(),
        }
        Some(player)
    }
}
