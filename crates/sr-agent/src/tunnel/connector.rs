//! Outbound tunnel connector
//!
//! Dials the relay, upgrades to a WebSocket and runs the agent's half of the
//! multiplexed session. The relay opens one stream per public client; the
//! agent forwards each of them to its target.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sr_core::config::AgentConfig;
use sr_core::RELAY_PORT_HEADER;
use sr_transport::{Incoming, Mode, MuxSession, WsConn};

use super::reconnect::ExponentialBackoff;
use crate::forward::forward_stream;

/// Connection errors that may require special handling
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The relay refused our token
    #[error("Authentication rejected by relay")]
    AuthRejected,

    /// The upgrade did not finish within `connect_timeout`
    #[error("Connection to relay timed out")]
    Timeout,

    /// The relay URL or token cannot form a request
    #[error("Invalid relay request: {0}")]
    InvalidRequest(String),

    /// WebSocket handshake or transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The relay ended the tunnel
    #[error("Tunnel closed by relay")]
    TunnelClosed,

    /// Shutdown was requested while connecting
    #[error("Cancelled")]
    Cancelled,
}

/// Establishes the outbound tunnel to the relay
pub struct TunnelConnector {
    /// Agent configuration
    config: AgentConfig,
}

impl TunnelConnector {
    /// Create a new tunnel connector
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect to the relay, retrying with `backoff` until it works.
    ///
    /// Returns `ConnectionError::AuthRejected` without retrying when the
    /// relay refuses the token, and `ConnectionError::Cancelled` once
    /// `cancel` fires.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<ActiveTunnel, ConnectionError> {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(tunnel) => {
                    tracing::info!(
                        "Connected to relay at {} (public port {})",
                        self.config.relay_url,
                        tunnel
                            .public_port()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "unknown".into())
                    );
                    backoff.reset();
                    return Ok(tunnel);
                }
                Err(ConnectionError::AuthRejected) => {
                    tracing::error!("Authentication rejected - check the agent's auth_token");
                    return Err(ConnectionError::AuthRejected);
                }
                Err(e @ ConnectionError::InvalidRequest(_)) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Attempt a single connection to the relay
    pub async fn connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let mut request = self
            .config
            .relay_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidRequest(e.to_string()))?;

        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ConnectionError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        tracing::debug!("Connecting to {}", self.config.relay_url);
        let (ws, response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| match e {
            WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                ConnectionError::AuthRejected
            }
            e => ConnectionError::WebSocket(e),
        })?;

        let public_port = response
            .headers()
            .get(RELAY_PORT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        // The relay initiates streams; the agent only accepts them
        let (session, incoming) = MuxSession::new(WsConn::new(ws), Mode::Server);

        Ok(ActiveTunnel {
            session,
            incoming,
            public_port,
        })
    }
}

/// An established tunnel to the relay
pub struct ActiveTunnel {
    session: MuxSession,
    incoming: Incoming,
    public_port: Option<u16>,
}

impl ActiveTunnel {
    /// Public port the relay assigned, if it reported one
    pub fn public_port(&self) -> Option<u16> {
        self.public_port
    }

    /// Forward relay streams to `target` until the tunnel ends.
    ///
    /// Returns `Ok(())` when `cancel` fires and `TunnelClosed` when the relay
    /// goes away. Forwards still running are stopped either way.
    pub async fn serve(
        mut self,
        cancel: &CancellationToken,
        target: &str,
        idle_timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let scope = cancel.child_token();
        let forwards = TaskTracker::new();

        let result = loop {
            let stream = tokio::select! {
                biased;
                _ = scope.cancelled() => break Ok(()),
                stream = self.incoming.accept() => match stream {
                    Some(stream) => stream,
                    None => break Err(ConnectionError::TunnelClosed),
                },
            };

            let scope = scope.clone();
            let target = target.to_string();
            forwards.spawn(async move {
                forward_stream(&scope, stream, &target, idle_timeout).await;
            });
        };

        scope.cancel();
        forwards.close();
        forwards.wait().await;
        self.session.close().await;

        if result.is_err() {
            tracing::warn!("Tunnel to relay closed");
        }
        result
    }
}
