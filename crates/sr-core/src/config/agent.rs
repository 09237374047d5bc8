//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the relay, e.g. `ws://relay.example.com:8080/`
    pub relay_url: String,

    /// Local service exposed through the relay
    pub target_address: String,

    /// Bearer token presented to the relay
    pub auth_token: Option<String>,

    /// Timeout for the WebSocket upgrade
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Idle window for forwarded connections
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/".to_string(),
            target_address: "127.0.0.1:22".to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Ceiling for the delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Random extra delay as a fraction of the base delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_from_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
            relay_url = "ws://relay.example.com:8080/"
            target_address = "127.0.0.1:5432"

            [backoff]
            initial = 2
            max = "5m"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay_url, "ws://relay.example.com:8080/");
        assert_eq!(config.target_address, "127.0.0.1:5432");
        assert_eq!(config.backoff.initial, Duration::from_secs(2));
        assert_eq!(config.backoff.max, Duration::from_secs(300));
        assert_eq!(config.backoff.multiplier, 2.0);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }
}
