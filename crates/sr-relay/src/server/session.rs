//! Lifetime of one upgraded agent connection

use std::sync::Arc;

use axum::extract::ws::WebSocket;

use sr_transport::{MuxSession, WsConn};

use crate::registry::AgentSession;
use crate::state::RelayState;

/// Run an admitted agent's session until its listener stops.
///
/// The agent is already registered. Its public port stays open exactly as
/// long as this future runs. When the listener returns, for whatever reason,
/// the tunnel is closed with a normal closure and the port released.
pub(super) async fn serve_agent(
    state: Arc<RelayState>,
    socket: WebSocket,
    agent: Arc<AgentSession>,
) {
    let port = agent.port;
    let session = MuxSession::client(WsConn::new(socket));

    tracing::info!(
        "Agent {} connected from {} on port {}",
        agent.id,
        agent
            .peer_addr
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".into()),
        port
    );

    let exit = state.listener.run(agent.scope(), port, &session).await;

    // Covers listener exits that leave the session up (bind, accept, open failures)
    session.close().await;
    state.registry.remove(port);

    tracing::info!(
        "Released port {} for agent {} after {:?} ({})",
        port,
        agent.id,
        agent.uptime(),
        exit
    );
}
