//! # Position sync server
//!
//! Authoritative server for a lightweight real-time multiplayer world. Each
//! client tab holds a WebSocket; every user identity controls one player that
//! walks in a straight line toward a target the client picks. The server owns
//! the only authoritative copy of every position and keeps clients in step
//! with deltas on change plus a periodic full-state reconciliation.
//!
//! ## Moving parts
//!
//! - [`game`]: the player store and the per-tick movement step.
//! - [`session`]: live connections per identity; several tabs of one user
//!   collapse onto one player.
//! - [`hub`]: the engine every other part goes through. It owns the store,
//!   the registry and the [`fanout`] broadcaster.
//! - [`tasks`]: movement tick, heartbeat and reconciliation timers.
//! - [`propagator`]: folds record-store changes (coins, color, username) into
//!   the broadcast stream.
//! - [`network`]: axum WebSocket route and per-connection loop.
//! - [`auth`] and [`records`]: the credential and user-record collaborators.
//!
//! ## Example
//!
//! ```rust,no_run
//! use position_sync::auth::JwtAuthenticator;
//! use position_sync::hub::{Hub, WorldSettings};
//! use position_sync::records::MemoryRecordStore;
//! use position_sync::{build_router, propagator, tasks};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let records = Arc::new(MemoryRecordStore::new());
//!     let hub = Arc::new(Hub::new(
//!         WorldSettings::default(),
//!         Arc::new(JwtAuthenticator::new("secret")),
//!         records,
//!     ));
//!     tasks::spawn_all(hub.clone(), tasks::Timing::default());
//!     propagator::spawn_propagator(hub.clone());
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, build_router(hub, None)).await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod game;
pub mod hub;
pub mod network;
pub mod propagator;
pub mod protocol;
pub mod records;
pub mod session;
pub mod tasks;

use admin::AdminState;
use axum::routing::get;
use axum::Router;
use hub::Hub;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// WebSocket endpoints at `/` and `/ws`, plus the admin route when enabled.
pub fn build_router(hub: Arc<Hub>, admin: Option<AdminState>) -> Router {
    let mut app = Router::new()
        .route("/", get(network::ws_route))
        .route("/ws", get(network::ws_route))
        .with_state(hub);

    if let Some(admin) = admin {
        app = app.merge(admin::router(admin));
    }

    app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}
