//! User record store consulted at connect time and watched for changes.
//!
//! The persistent store itself lives outside this service; [`RecordStore`] is
//! the seam. [`MemoryRecordStore`] is the in-process implementation used by the
//! binary and the tests. Every mutation bumps a store-wide revision that is
//! stamped on the record and on the emitted [`FieldChange`], so consumers can
//! tell which of two observations of the same user is newer.

use crate::error::{Result, SyncError};
use crate::game::UserId;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

pub const DEFAULT_COLOR: &str = "green";

pub const PALETTE: [&str; 12] = [
    "red", "green", "blue", "orange", "purple", "yellow", "cyan", "magenta", "lime", "pink",
    "teal", "brown",
];

const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub coins: i64,
    pub color: String,
    /// Store revision of the last mutation of this record.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    Coins,
    Color,
    Username,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeChange {
    Coins(i64),
    Color(String),
    Username(String),
}

impl AttributeChange {
    pub fn field(&self) -> RecordField {
        match self {
            AttributeChange::Coins(_) => RecordField::Coins,
            AttributeChange::Color(_) => RecordField::Color,
            AttributeChange::Username(_) => RecordField::Username,
        }
    }
}

/// One field of one user record changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub identity: UserId,
    pub revision: u64,
    pub change: AttributeChange,
}

/// Subscription to record changes, filtered to the fields of interest.
pub struct ChangeFeed {
    rx: broadcast::Receiver<FieldChange>,
    fields: Vec<RecordField>,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<FieldChange>, fields: &[RecordField]) -> Self {
        Self {
            rx,
            fields: fields.to_vec(),
        }
    }

    /// Next relevant change, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<FieldChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.fields.contains(&change.change.field()) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Change feed lagged, {} record changes skipped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>>;

    fn watch(&self, fields: &[RecordField]) -> ChangeFeed;
}

/// Entry of a seed file. Missing `id` falls back to the username.
#[derive(Debug, Deserialize)]
struct SeedUser {
    id: Option<String>,
    username: String,
    #[serde(default)]
    coins: i64,
    color: Option<String>,
}

pub struct MemoryRecordStore {
    users: RwLock<HashMap<UserId, UserRecord>>,
    revision: AtomicU64,
    changes: broadcast::Sender<FieldChange>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            users: RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
            changes,
        }
    }

    /// Load a JSON array of users. Users without a color get a random one
    /// from the palette.
    pub async fn load_seed_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let seeds: Vec<SeedUser> = serde_json::from_str(&text)?;
        let store = Self::new();
        for seed in seeds {
            let color = seed.color.unwrap_or_else(random_color);
            let id = seed.id.unwrap_or_else(|| seed.username.clone());
            store
                .insert(UserId::from(id), seed.username, seed.coins, color)
                .await?;
        }
        info!(
            "Loaded {} user records from {}",
            store.users.read().await.len(),
            path.as_ref().display()
        );
        Ok(store)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Add a user. Usernames are unique, like the original user collection.
    pub async fn insert(
        &self,
        id: UserId,
        username: String,
        coins: i64,
        color: String,
    ) -> Result<UserRecord> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == username) {
            return Err(SyncError::Record(format!("username {} already exists", username)));
        }
        let record = UserRecord {
            id: id.clone(),
            username,
            coins,
            color,
            revision: self.next_revision(),
        };
        users.insert(id, record.clone());
        Ok(record)
    }

    pub async fn find_user_by_id(&self, id: &UserId) -> Option<UserRecord> {
        self.users.read().await.get(id).cloned()
    }

    /// Apply one field change and publish it on the change feed.
    pub async fn update(&self, id: &UserId, change: AttributeChange) -> Result<FieldChange> {
        let mut users = self.users.write().await;
        if let AttributeChange::Username(name) = &change {
            if users.values().any(|u| &u.username == name && &u.id != id) {
                return Err(SyncError::Record(format!("username {} already exists", name)));
            }
        }
        let record = users
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownUser(id.to_string()))?;
        match &change {
            AttributeChange::Coins(coins) => record.coins = *coins,
            AttributeChange::Color(color) => record.color = color.clone(),
            AttributeChange::Username(name) => record.username = name.clone(),
        }
        record.revision = self.next_revision();
        let event = FieldChange {
            identity: id.clone(),
            revision: record.revision,
            change,
        };
        // Publish under the write lock so feed order matches revision order.
        let _ = self.changes.send(event.clone());
        Ok(event)
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.username == username).cloned())
    }

    fn watch(&self, fields: &[RecordField]) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe(), fields)
    }
}

pub fn random_color() -> String {
    let mut rng = rand::rng();
    PALETTE
        .choose(&mut rng)
        .copied()
        .unwrap_or(DEFAULT_COLOR)
        .to_string()
}
