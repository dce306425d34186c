//! Stranger chat matching server - Entry Point
//!
//! Loads configuration, starts the MatchServer actor and accepts connections.

use std::env;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stranger_chat::{handle_connection, Config, MatchServer};

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG controls the level, e.g. RUST_LOG=stranger_chat=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stranger_chat=info")),
        )
        .init();

    let mut config = Config::from_env()?;
    // A bind address on the command line wins over BIND_ADDR
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Stranger chat server listening on {}", config.bind_addr);
    info!(
        "Stale after {:?}, search timeout {:?}, sweep every {:?}",
        config.lobby.stale_after, config.lobby.search_timeout, config.sweep_interval
    );

    let ping_interval = config.ping_interval;
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let server = MatchServer::new(cmd_rx, config);
    tokio::spawn(server.run());

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let cmd_tx = cmd_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, cmd_tx, ping_interval).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
