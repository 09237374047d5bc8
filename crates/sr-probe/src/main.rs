//! sybil-relay probe
//!
//! Connects to a relay's public port, sends a message twice and prints the
//! first reply. Handy for checking a tunnel by hand.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pause between the two writes
const RESEND_DELAY: Duration = Duration::from_secs(3);

/// How long the connection stays open
const LINGER: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "sr-probe")]
#[command(about = "Probe a sybil-relay public port")]
#[command(version)]
struct Args {
    /// Address of the relay's public port, e.g. relay.example.com:3001
    #[arg(short, long)]
    server: String,

    /// Message to send
    #[arg(short, long, default_value = "ping")]
    message: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let conn = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("Failed to connect to {}", args.server))?;
    tracing::info!("Connected to {}", args.server);

    let (mut rd, mut wr) = conn.into_split();

    let message = args.message.into_bytes();
    let writer = tokio::spawn(async move {
        for round in 0..2 {
            if round > 0 {
                tokio::time::sleep(RESEND_DELAY).await;
            }
            if let Err(e) = wr.write_all(&message).await {
                tracing::warn!("Write failed: {}", e);
                return;
            }
            tracing::info!("Sent {} bytes", message.len());
        }
    });

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        match rd.read(&mut buf).await {
            Ok(0) => tracing::info!("Connection closed before any reply"),
            Ok(n) => tracing::info!("Reply: {}", String::from_utf8_lossy(&buf[..n])),
            Err(e) => tracing::warn!("Read failed: {}", e),
        }
    });

    tokio::time::sleep(LINGER).await;
    writer.abort();
    reader.abort();

    tracing::info!("Done");
    Ok(())
}
