//! Registry of connected agents, keyed by their public port

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sr_core::error::RegistryError;
use sr_core::time::{current_time_millis, elapsed_since};
use sr_core::AgentId;

/// One connected agent
pub struct AgentSession {
    /// Session identifier
    pub id: AgentId,
    /// Public port assigned to this agent; fixed for the session's lifetime
    pub port: u16,
    /// Remote address of the agent's upgraded connection
    pub peer_addr: Option<SocketAddr>,
    /// Creation time (ms since UNIX epoch)
    pub created_at: u64,
    /// Scope covering the agent's listener and proxy pairs
    cancel: CancellationToken,
}

impl AgentSession {
    /// Create a session for `port`
    pub fn new(port: u16, peer_addr: Option<SocketAddr>, cancel: CancellationToken) -> Self {
        Self {
            id: AgentId::new(),
            port,
            peer_addr,
            created_at: current_time_millis(),
            cancel,
        }
    }

    /// Scope the agent's listener and proxy pairs run under
    pub fn scope(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the agent's listener and every proxy pair it spawned
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// How long the agent has been connected
    pub fn uptime(&self) -> Duration {
        elapsed_since(self.created_at)
    }
}

/// Active agents indexed by public port
pub struct AgentRegistry {
    agents: DashMap<u16, Arc<AgentSession>>,
    max_agents: Option<usize>,
    /// Serializes the limit check with the insert
    admission: Mutex<()>,
}

impl AgentRegistry {
    /// Create an empty registry with an optional agent limit
    pub fn new(max_agents: Option<usize>) -> Self {
        Self {
            agents: DashMap::new(),
            max_agents,
            admission: Mutex::new(()),
        }
    }

    /// Register an agent on its port.
    ///
    /// Fails if the port already has an agent or the limit is reached.
    /// Concurrent callers never push the count past the limit.
    pub fn register(&self, session: Arc<AgentSession>) -> Result<(), RegistryError> {
        let _admission = self.admission.lock();
        if let Some(max) = self.max_agents {
            if self.agents.len() >= max {
                return Err(RegistryError::LimitReached(max));
            }
        }

        match self.agents.entry(session.port) {
            Entry::Occupied(_) => Err(RegistryError::PortInUse(session.port)),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Remove the agent on `port`
    pub fn remove(&self, port: u16) -> Option<Arc<AgentSession>> {
        self.agents.remove(&port).map(|(_, session)| session)
    }

    /// List all agents, ordered by port
    pub fn list(&self) -> Vec<Arc<AgentSession>> {
        let mut agents: Vec<_> = self.agents.iter().map(|r| Arc::clone(&r)).collect();
        agents.sort_by_key(|a| a.port);
        agents
    }

    /// Whether another agent would exceed the limit
    pub fn is_full(&self) -> bool {
        self.max_agents
            .map(|max| self.agents.len() >= max)
            .unwrap_or(false)
    }

    /// Number of connected agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(port: u16) -> Arc<AgentSession> {
        Arc::new(AgentSession::new(port, None, CancellationToken::new()))
    }

    #[test]
    fn test_register_and_remove() {
        let registry = AgentRegistry::default();
        registry.register(session(3001)).unwrap();
        registry.register(session(3002)).unwrap();

        assert_eq!(registry.len(), 2);
        let ports: Vec<u16> = registry.list().iter().map(|a| a.port).collect();
        assert_eq!(ports, vec![3001, 3002]);

        assert_eq!(registry.remove(3001).unwrap().port, 3001);
        assert!(registry.remove(3001).is_none());
        let ports: Vec<u16> = registry.list().iter().map(|a| a.port).collect();
        assert_eq!(ports, vec![3002]);
    }

    #[test]
    fn test_one_agent_per_port() {
        let registry = AgentRegistry::default();
        registry.register(session(3001)).unwrap();
        assert_eq!(
            registry.register(session(3001)),
            Err(RegistryError::PortInUse(3001))
        );
    }

    #[test]
    fn test_agent_limit() {
        let registry = AgentRegistry::new(Some(1));
        assert!(!registry.is_full());
        registry.register(session(3001)).unwrap();
        assert!(registry.is_full());
        assert_eq!(
            registry.register(session(3002)),
            Err(RegistryError::LimitReached(1))
        );

        registry.remove(3001);
        registry.register(session(3002)).unwrap();
    }

    #[test]
    fn test_agent_limit_holds_under_contention() {
        let registry = Arc::new(AgentRegistry::new(Some(2)));

        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register(session(3001 + i)).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_disconnect_cancels_scope() {
        let cancel = CancellationToken::new();
        let agent = AgentSession::new(3001, None, cancel.child_token());
        assert!(!agent.scope().is_cancelled());
        agent.disconnect();
        assert!(agent.scope().is_cancelled());
        assert!(!cancel.is_cancelled());
    }
}
