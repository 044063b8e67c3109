//! Multi-room Chat Relay - Entry Point
//!
//! Starts the TCP listener, the dispatch hub actor and the general
//! room, then accepts connections.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{
    handle_connection, Argon2Store, Context, DiskStore, Hub, Reassembler, RoomDirectory,
    ServerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let mut config = ServerConfig::from_env();

    // Bind address from command line overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }
    let config = Arc::new(config);

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Chat relay listening on {}", config.bind_addr);
    info!("Received files are stored under {}", config.download_dir.display());

    let store = DiskStore::new(&config.download_dir);
    let transfers = Arc::new(Reassembler::with_max_file_size(
        Arc::new(store),
        config.max_file_size,
    ));
    let directory = Arc::new(RoomDirectory::new(config.room_queue_capacity));

    // Create hub actor channel and start
    let (hub_tx, hub_rx) = mpsc::channel(config.hub_queue_capacity);
    let hub = Hub::new(hub_rx, directory, transfers.clone());
    tokio::spawn(hub.run());

    let ctx = Context {
        hub: hub_tx,
        credentials: Arc::new(Argon2Store::new()),
        transfers,
        config,
    };

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let ctx = ctx.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
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
