//! Relay HTTP server
//!
//! Serves the WebSocket upgrade endpoint agents connect to. Every path is
//! handled the same way; requests that are not tunnel upgrades are
//! redirected away.

mod handler;
mod session;

pub use handler::RELAY_PORT_HEADER;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;

use crate::state::RelayState;

/// The relay's HTTP front end
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Create a server over shared state
    pub fn new(state: Arc<RelayState>) -> Self {
        Self { state }
    }

    /// Router handling every request with the upgrade handler
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handler::handle_request)
            .with_state(Arc::clone(&self.state))
    }

    /// Bind `bind_addr` and serve until the root scope is cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the root scope is cancelled.
    ///
    /// After the HTTP side stops, agent sessions get `shutdown_grace` to wind
    /// down before they are abandoned.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Relay listening on ws://{}", local_addr);
        if !self.state.policy.requires_token() {
            tracing::warn!("No auth token configured, any agent may connect");
        }

        let cancel = self.state.cancel.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Relay HTTP server failed")?;

        self.shutdown_agents().await;
        Ok(())
    }

    async fn shutdown_agents(&self) {
        let state = &self.state;

        // Child scopes stop every listener and proxy pair
        state.cancel.cancel();
        state.tracker.close();

        let agents = state.registry.list();
        if !agents.is_empty() {
            tracing::info!("Waiting for {} agent sessions to close", agents.len());
        }
        for agent in &agents {
            tracing::debug!(
                "Disconnecting agent {} on port {} (up {:?})",
                agent.id,
                agent.port,
                agent.uptime()
            );
            agent.disconnect();
        }

        if tokio::time::timeout(state.config.shutdown_grace, state.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} agent sessions still open after {:?}, abandoning them",
                state.tracker.len(),
                state.config.shutdown_grace
            );
        }
    }
}
