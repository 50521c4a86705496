use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// Use jemalloc on Linux for reduced fragmentation on long-running processes.
// Other platforms keep the system allocator.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use cipherpost_server::config::ServerConfig;
use cipherpost_server::database::{self, unix_now};
use cipherpost_server::db::sqlite::SqliteBackend;
use cipherpost_server::db::DatabaseBackend;
use cipherpost_server::routing;
use cipherpost_server::websocket::ServerState;

/// Envelopes destroyed per sweep batch
const SWEEP_BATCH: u32 = 200;

/// Seconds between delivered-queue purges
const PURGE_INTERVAL: u64 = 3600;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cipherpost_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting Cipherpost server");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let db_pool = database::init(&config.database_url).await?;
    info!("Database initialized");

    let db: Arc<dyn DatabaseBackend> = Arc::new(SqliteBackend::new(db_pool));
    let state = Arc::new(ServerState::new(db.clone(), config.clone()));

    // Ephemeral sweeper: the store exposes destroy, scheduling lives here
    {
        let db = db.clone();
        let every = config.sweep_interval_seconds;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(every));
            loop {
                interval.tick().await;
                if let Err(e) = db.sweep_due(unix_now(), SWEEP_BATCH).await {
                    warn!("Ephemeral sweep error: {}", e);
                }
            }
        });
        info!("Ephemeral sweeper started (every {}s)", every);
    }

    // Delivered queue retention
    {
        let db = db.clone();
        let retention = config.delivered_retention_seconds;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(PURGE_INTERVAL));
            loop {
                interval.tick().await;
                if let Err(e) = db.purge_delivered(unix_now() - retention).await {
                    warn!("Delivery queue purge error: {}", e);
                }
            }
        });
        info!("Delivery queue purge started (retention={}s)", retention);
    }

    let app = routing::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("Checkpointing SQLite WAL...");
    if let Err(e) = db.checkpoint().await {
        warn!("{:#}", e);
    }

    info!("Server stopped cleanly");
    Ok(())
}
