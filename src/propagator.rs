//! Folds out-of-band record changes into the live broadcast stream.

use crate::hub::Hub;
use crate::records::RecordField;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const WATCHED_FIELDS: [RecordField; 3] =
    [RecordField::Coins, RecordField::Color, RecordField::Username];

/// Subscribe to the record store's change feed and apply every relevant
/// change through the hub. The subscription is taken before this returns, so
/// no change made after boot is missed.
pub fn spawn_propagator(hub: Arc<Hub>) -> JoinHandle<()> {
    let mut feed = hub.records().watch(&WATCHED_FIELDS);
    info!("Watching record changes for {:?}", WATCHED_FIELDS);
    tokio::spawn(async move {
        while let Some(change) = feed.next().await {
            hub.apply_external_change(&change).await;
        }
        warn!("Record change feed closed");
    })
}
