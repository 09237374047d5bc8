//! sybil-relay server
//!
//! Accepts agent tunnels and exposes each agent on its own public port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sr_core::config::{self, RelayConfig};
use sr_core::ListenAddress;
use sr_relay::{RelayServer, RelayState};

#[derive(Parser)]
#[command(name = "sr-relay")]
#[command(about = "sybil-relay tunnel server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. ":8080" (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("sybil-relay starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_relay_config_path);
    let mut config: RelayConfig = config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if let Some(listen) = args.listen {
        config.bind_address = listen;
    }
    config.validate()?;

    let listen: ListenAddress = config.listen_address()?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let state = Arc::new(RelayState::new(config, cancel));
    let server = RelayServer::new(state);
    server.run(listen.as_str()).await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
