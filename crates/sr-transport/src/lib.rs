//! sr-transport: Tunnel transport for sybil-relay
//!
//! This crate turns an upgraded WebSocket into a plain byte stream, runs a
//! yamux session over it, and relays bytes between pairs of duplex
//! transports. Both the relay and the agent build on it.

pub mod error;
pub mod mux;
pub mod proxy;
pub mod ws;

pub use error::TransportError;
pub use mux::{Incoming, MuxSession, MuxStream, StreamOpener};
pub use proxy::{run_pair, PairReport, DEFAULT_IDLE_TIMEOUT};
pub use ws::{WsConn, WsMessage, WsPayload};

/// Re-exported so callers can pick the multiplexing role without a direct
/// dependency on yamux.
pub use yamux::Mode;
