use anyhow::Context;
use clap::Parser;
use position_sync::admin::AdminState;
use position_sync::auth::JwtAuthenticator;
use position_sync::config::Config;
use position_sync::hub::Hub;
use position_sync::records::MemoryRecordStore;
use position_sync::{build_router, propagator, tasks};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "position_sync=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let records = Arc::new(match &config.users_file {
        Some(path) => MemoryRecordStore::load_seed_file(path)
            .await
            .with_context(|| format!("loading users from {}", path.display()))?,
        None => {
            warn!("No users file given, record store starts empty");
            MemoryRecordStore::new()
        }
    });

    let hub = Arc::new(Hub::new(
        config.world_settings(),
        Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        records.clone(),
    ));

    // Process-lifetime background work.
    tasks::spawn_all(hub.clone(), config.timing());
    propagator::spawn_propagator(hub.clone());

    let admin = config.admin_token.clone().map(|token| {
        info!("Admin record route enabled");
        AdminState::new(records, token)
    });
    let app = build_router(hub, admin);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on: {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
