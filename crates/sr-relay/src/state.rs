//! Shared relay state

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sr_core::config::RelayConfig;

use crate::allocator::PortAllocator;
use crate::auth::AccessPolicy;
use crate::listener::PortListener;
use crate::registry::AgentRegistry;

/// State shared by every request handler and agent session
pub struct RelayState {
    /// Configuration
    pub config: RelayConfig,
    /// Public port counter
    pub allocator: PortAllocator,
    /// Connected agents
    pub registry: AgentRegistry,
    /// Accept loop settings for agent ports
    pub listener: PortListener,
    /// Token and origin checks
    pub policy: AccessPolicy,
    /// Root scope; every agent session runs under a child of it
    pub cancel: CancellationToken,
    /// Agent session tasks, awaited during shutdown
    pub tracker: TaskTracker,
}

impl RelayState {
    /// Create relay state from configuration
    pub fn new(config: RelayConfig, cancel: CancellationToken) -> Self {
        Self {
            allocator: PortAllocator::new(config.port_start),
            registry: AgentRegistry::new(config.max_agents),
            listener: PortListener::new(config.public_bind.clone(), config.idle_timeout),
            policy: AccessPolicy::from_config(&config),
            cancel,
            tracker: TaskTracker::new(),
            config,
        }
    }
}
