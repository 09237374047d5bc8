//! Core error types for sybil-relay

use std::path::PathBuf;
use thiserror::Error;

/// Port allocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The counter reached the top of the port range; ports are never reused
    #[error("Port range exhausted after {last}")]
    Exhausted { last: u16 },
}

/// Agent registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Another agent session still owns the port
    #[error("Port {0} already has an active agent")]
    PortInUse(u16),

    /// The configured agent limit was reached
    #[error("Agent limit of {0} reached")]
    LimitReached(usize),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
