//! Upgrade request handler

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use crate::registry::AgentSession;
use crate::state::RelayState;

use super::session::serve_agent;

/// Response header carrying the public port assigned to the agent
pub const RELAY_PORT_HEADER: HeaderName = HeaderName::from_static(sr_core::RELAY_PORT_HEADER);

/// Handle any inbound request.
///
/// Plain HTTP traffic is redirected away. Upgrade requests are checked
/// against the access policy and the agent limit; admitted agents get a port
/// and a registry slot, and their session runs in a tracked task once the
/// upgrade completes.
pub(super) async fn handle_request(
    State(state): State<Arc<RelayState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    tracing::debug!(
        "{} {} from {}",
        method,
        uri,
        peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
    );

    if !declares_websocket_upgrade(&headers) {
        return redirect(&state.config.redirect_url);
    }

    if let Err(denial) = state.policy.check(&headers) {
        tracing::warn!("Rejected upgrade from {:?}: {:?}", peer, denial);
        return denial.status().into_response();
    }

    if state.registry.is_full() {
        tracing::warn!(
            "Rejected upgrade from {:?}: {} agents connected",
            peer,
            state.registry.len()
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("Upgrade from {:?} failed: {}", peer, e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let port = match state.allocator.next() {
        Ok(port) => port,
        Err(e) => {
            tracing::error!("Cannot assign a port to {:?}: {}", peer, e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    // Take the agent slot before answering 101 so concurrent upgrades
    // cannot overshoot the limit
    let agent = Arc::new(AgentSession::new(port, peer, state.cancel.child_token()));
    if let Err(e) = state.registry.register(Arc::clone(&agent)) {
        tracing::warn!("Rejected upgrade from {:?}: {}", peer, e);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let failed_state = Arc::clone(&state);
    let session_state = Arc::clone(&state);
    let mut response = ws
        .on_failed_upgrade(move |e| {
            tracing::warn!("Upgrade for port {} failed: {}", port, e);
            failed_state.registry.remove(port);
        })
        .on_upgrade(move |socket| {
            let tracker = session_state.tracker.clone();
            tracker.track_future(serve_agent(session_state, socket, agent))
        });

    response
        .headers_mut()
        .insert(RELAY_PORT_HEADER, HeaderValue::from(port));
    response
}

fn declares_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|proto| proto.trim().eq_ignore_ascii_case("websocket"))
        })
        .unwrap_or(false)
}

fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(_) => {
            tracing::error!("Configured redirect URL is not a valid header: {}", location);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
