//! Signal Relay Server
//!
//! WebSocket signaling relay for WebRTC. Tracks which peers are in which room
//! and forwards join, offer/answer and ICE candidate messages between them.

mod config;
mod room;
mod server;
mod signaling;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::RelayConfig;
use room::RoomRegistry;
use server::{ServerConfig, SignalServer};
use signaling::SignalingRouter;

/// Signal Relay Server
///
/// WebSocket signaling relay for WebRTC peers
#[derive(Parser, Debug)]
#[command(name = "signal-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Signal Relay v{}", env!("CARGO_PKG_VERSION"));

    let relay_config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            RelayConfig::load(path)?
        }
        None => RelayConfig::default(),
    }
    .with_overrides(args.bind, args.port);
    relay_config.validate()?;

    // The registry lives for the whole process and is shared by every connection
    let registry = Arc::new(RoomRegistry::with_retain_empty_rooms(
        relay_config.rooms.retain_empty,
    ));
    if registry.retains_empty_rooms() {
        info!("Empty rooms are retained");
    }
    let router = Arc::new(SignalingRouter::new(registry));

    let server = Arc::new(SignalServer::new(
        ServerConfig::from(&relay_config.server),
        router,
    ));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
