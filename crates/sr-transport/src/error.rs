//! Transport error types

use thiserror::Error;

/// Errors raised by the tunnel transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The multiplexed session is gone (closed locally or by the peer)
    #[error("Multiplexed session closed")]
    SessionClosed,

    /// The multiplexer rejected an operation
    #[error("Multiplexer error: {0}")]
    Mux(#[from] yamux::ConnectionError),

    /// Announcing a new stream to the peer failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
