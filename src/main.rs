//! Chess Arena Server
//!
//! Authoritative session server for real-time two-player chess.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chess_arena::{
    network::{auth::AuthConfig, server::{GameServer, ServerConfig}},
    store::{FileGameStore, GameStore, MemoryGameStore},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let auth = AuthConfig::from_env();

    info!("Chess Arena Server v{}", VERSION);
    match &config.clock {
        Some(clock) => info!(
            "Clock: {}s + {}s per move",
            clock.initial.as_secs(),
            clock.increment.as_secs()
        ),
        None => info!("Clock: disabled"),
    }
    if !auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; every connection will be rejected");
    }

    let store: Arc<dyn GameStore> = match &config.store_dir {
        Some(dir) => {
            info!("Persisting games under {}", dir.display());
            Arc::new(
                FileGameStore::open(dir)
                    .await
                    .with_context(|| format!("opening store directory {}", dir.display()))?,
            )
        }
        None => {
            info!("Persisting games in memory only");
            Arc::new(MemoryGameStore::new())
        }
    };

    let server = Arc::new(GameServer::new(config, auth, store));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server failed")?;
    info!("Server stopped");
    Ok(())
}
