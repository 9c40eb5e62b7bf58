//! Fixed-interval background loops. Each runs for the life of the process.

use crate::hub::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub tick: Duration,
    pub heartbeat: Duration,
    pub reconcile: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(16),
            heartbeat: Duration::from_secs(10),
            reconcile: Duration::from_millis(1000),
        }
    }
}

/// Movement simulator: advances every player with a target each tick.
pub fn spawn_movement(hub: Arc<Hub>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            hub.tick().await;
        }
    })
}

/// Liveness monitor: pings acknowledged connections, terminates silent ones.
pub fn spawn_heartbeat(hub: Arc<Hub>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first tick since it fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sweep = hub.heartbeat_cycle().await;
            debug!(
                "Heartbeat: {} pinged, {} terminated",
                sweep.pinged.len(),
                sweep.terminated.len()
            );
        }
    })
}

/// Reconciliation: periodic full-state broadcast.
pub fn spawn_reconciliation(hub: Arc<Hub>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            hub.reconcile().await;
        }
    })
}

pub fn spawn_all(hub: Arc<Hub>, timing: Timing) -> Vec<JoinHandle<()>> {
    info!(
        "Starting timers: movement {:?}, heartbeat {:?}, reconcile {:?}",
        timing.tick, timing.heartbeat, timing.reconcile
    );
    vec![
        spawn_movement(hub.clone(), timing.tick),
        spawn_heartbeat(hub.clone(), timing.heartbeat),
        spawn_reconciliation(hub, timing.reconcile),
    ]
}
