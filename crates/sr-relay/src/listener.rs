//! Per-agent port listener
//!
//! Binds the agent's public port and turns every accepted client connection
//! into a proxy pair over a freshly opened stream. The accept loop stops on
//! the first accept or stream-open failure (no retry, no rebind), when the
//! agent's scope is cancelled, or as soon as the agent's session dies.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sr_transport::{run_pair, StreamOpener, TransportError};

/// Why a listener stopped
#[derive(Debug)]
pub enum ListenerExit {
    /// The agent's scope was cancelled
    Cancelled,
    /// The agent's multiplexed session ended
    SessionClosed,
    /// The port could not be bound
    BindFailed(io::Error),
    /// Accepting a client failed
    AcceptFailed(io::Error),
    /// Opening a stream towards the agent failed
    OpenFailed(TransportError),
}

impl fmt::Display for ListenerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerExit::Cancelled => write!(f, "cancelled"),
            ListenerExit::SessionClosed => write!(f, "agent session closed"),
            ListenerExit::BindFailed(e) => write!(f, "bind failed: {}", e),
            ListenerExit::AcceptFailed(e) => write!(f, "accept failed: {}", e),
            ListenerExit::OpenFailed(e) => write!(f, "stream open failed: {}", e),
        }
    }
}

/// Runs accept loops on agent ports
#[derive(Debug, Clone)]
pub struct PortListener {
    /// Host the agent ports are bound on
    bind_host: String,
    /// Idle window for each proxy pair
    idle_timeout: Duration,
}

impl PortListener {
    /// Create a listener manager
    pub fn new(bind_host: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            bind_host: bind_host.into(),
            idle_timeout,
        }
    }

    /// Bind `port` and proxy clients to `session` until the loop stops.
    ///
    /// Proxy pairs run in their own tasks under children of `cancel`; they
    /// may outlive the loop when it stops on an accept or open failure.
    pub async fn run<S>(&self, cancel: &CancellationToken, port: u16, session: &S) -> ListenerExit
    where
        S: StreamOpener,
    {
        let listener = match TcpListener::bind((self.bind_host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Error listening on port {}: {}", port, e);
                return ListenerExit::BindFailed(e);
            }
        };
        tracing::info!("Listening for clients on {}:{}", self.bind_host, port);

        let mut pairs = 0u64;
        let exit = loop {
            let (conn, client_addr) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ListenerExit::Cancelled,
                _ = session.closed() => break ListenerExit::SessionClosed,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Error accepting on port {}: {}", port, e);
                        break ListenerExit::AcceptFailed(e);
                    }
                },
            };
            tracing::debug!("Accepted client {} on port {}", client_addr, port);

            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ListenerExit::Cancelled,
                opened = session.open_stream() => match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("Error opening stream on port {}: {}", port, e);
                        break ListenerExit::OpenFailed(e);
                    }
                },
            };

            pairs += 1;
            let pair_cancel = cancel.child_token();
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                let report = run_pair(&pair_cancel, conn, stream, idle_timeout).await;
                match &report.error {
                    None => tracing::debug!(
                        "Proxy for {} on port {} done ({} bytes up, {} down)",
                        client_addr,
                        port,
                        report.upstream_bytes,
                        report.downstream_bytes
                    ),
                    Some(e) => tracing::debug!(
                        "Proxy for {} on port {} ended with error: {}",
                        client_addr,
                        port,
                        e
                    ),
                }
            });
        };

        tracing::info!(
            "Stopped accepting on port {} after {} connections: {}",
            port,
            pairs,
            exit
        );
        exit
    }
}
