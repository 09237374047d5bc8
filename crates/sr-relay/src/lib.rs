//! sr-relay: Public relay for reverse tunnels
//!
//! Agents dial in over a WebSocket upgrade. Each upgraded connection carries
//! a yamux session, and the relay exposes the agent on its own public TCP
//! port: every client accepted there is proxied over a fresh stream opened
//! through the agent's tunnel.

pub mod allocator;
pub mod auth;
pub mod listener;
pub mod registry;
pub mod server;
pub mod state;

pub use allocator::PortAllocator;
pub use registry::{AgentRegistry, AgentSession};
pub use server::{RelayServer, RELAY_PORT_HEADER};
pub use state::RelayState;
