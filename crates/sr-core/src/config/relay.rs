//! Relay server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::ListenAddress;

/// Configuration for the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket endpoint listens on (`:8080` means all interfaces)
    pub bind_address: String,

    /// Host on which per-agent public ports are bound
    pub public_bind: String,

    /// Port counter start; the first agent gets `port_start + 1`
    pub port_start: u16,

    /// How long a proxy pair may go without traffic before it is torn down
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// How long shutdown waits for agent sessions to wind down
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Where non-tunnel HTTP requests are redirected
    pub redirect_url: String,

    /// Accepted `Origin` header values; `*` accepts any origin
    pub allowed_origins: Vec<String>,

    /// Bearer token agents must present; no authentication when unset
    pub auth_token: Option<String>,

    /// Maximum number of concurrently connected agents
    pub max_agents: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: ":8080".to_string(),
            public_bind: "0.0.0.0".to_string(),
            // Keep agent ports out of the privileged range
            port_start: 3000,
            idle_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            redirect_url: "https://www.microsoft.com/".to_string(),
            allowed_origins: vec!["*".to_string()],
            auth_token: None,
            max_agents: None,
        }
    }
}

impl RelayConfig {
    /// The parsed HTTP listen address
    pub fn listen_address(&self) -> Result<ListenAddress, ConfigError> {
        self.bind_address.parse().map_err(ConfigError::Invalid)
    }

    /// Check values that would make the relay misbehave at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address()?;

        if self.port_start < 1024 {
            return Err(ConfigError::Invalid(format!(
                "port_start {} is in the privileged range",
                self.port_start
            )));
        }
        if self.port_start == u16::MAX {
            return Err(ConfigError::Invalid(
                "port_start leaves no ports to allocate".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_agents == Some(0) {
            return Err(ConfigError::Invalid(
                "max_agents must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_address().unwrap().as_str(), "0.0.0.0:8080");
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            port_start = 5000
            idle_timeout = "30s"
            allowed_origins = ["https://example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.port_start, 5000);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.allowed_origins, vec!["https://example.com"]);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_validate_rejects_privileged_start() {
        let config = RelayConfig {
            port_start: 80,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_idle_timeout() {
        let config = RelayConfig {
            idle_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
