//! sr-agent: Tunnel agent for sybil-relay
//!
//! The agent dials the relay over a WebSocket, runs a yamux session over
//! it, and forwards every stream the relay opens to a local target service.

pub mod forward;
pub mod tunnel;

pub use tunnel::{ActiveTunnel, ConnectionError, ExponentialBackoff, TunnelConnector};
