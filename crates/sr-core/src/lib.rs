//! sr-core: Core abstractions and configuration for sybil-relay
//!
//! This crate provides shared types, errors, and configuration structures
//! used by the relay server, the agent, and the probe tool.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use types::{AgentId, ListenAddress};

/// Response header in which the relay reports an agent's public port
pub const RELAY_PORT_HEADER: &str = "x-relay-port";
