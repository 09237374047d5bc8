//! sybil-relay agent
//!
//! Keeps a tunnel open to the relay and forwards every client the relay
//! accepts on our public port to a local target.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sr_core::config::{self, AgentConfig};
use sr_agent::{ConnectionError, ExponentialBackoff, TunnelConnector};

#[derive(Parser)]
#[command(name = "sr-agent")]
#[command(about = "sybil-relay tunnel agent")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL (overrides config)
    #[arg(short, long)]
    relay: Option<String>,

    /// Local address to expose (overrides config)
    #[arg(short, long)]
    target: Option<String>,

    /// Bearer token for the relay
    #[arg(long, env = "SR_AGENT_TOKEN")]
    token: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("sybil-relay agent starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_agent_config_path);
    let mut config: AgentConfig = config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if let Some(relay) = args.relay {
        config.relay_url = relay;
    }
    if let Some(target) = args.target {
        config.target_address = target;
    }
    if args.token.is_some() {
        config.auth_token = args.token;
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        signal_cancel.cancel();
    });

    tracing::info!(
        "Exposing {} through {}",
        config.target_address,
        config.relay_url
    );

    let connector = TunnelConnector::new(config);
    let config = connector.config();
    let mut backoff = ExponentialBackoff::from_config(&config.backoff);

    loop {
        let tunnel = match connector.connect_with_retry(&mut backoff, &cancel).await {
            Ok(tunnel) => tunnel,
            Err(ConnectionError::Cancelled) => break,
            Err(e) => return Err(e).context("Giving up on relay"),
        };

        match tunnel
            .serve(&cancel, &config.target_address, config.idle_timeout)
            .await
        {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!("{}, reconnecting in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::info!("Agent shutdown complete");
    Ok(())
}
