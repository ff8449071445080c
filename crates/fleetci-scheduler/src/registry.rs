//! Connected agents and their live capacity.

use chrono::{DateTime, Duration, Utc};
use fleetci_core::protocol::{AgentInfo, AgentStatus, CoordinatorMessage};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound half of an agent connection.
pub type AgentSender = mpsc::UnboundedSender<CoordinatorMessage>;

#[derive(Debug)]
pub struct AgentState {
    pub agent_id: String,
    pub info: AgentInfo,
    pub status: AgentStatus,
    /// Effective limit. Starts at the registered value and may be changed by
    /// an operator without touching the queue.
    pub max_concurrent_jobs: u32,
    pub running: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    sender: AgentSender,
}

impl AgentState {
    pub fn has_capacity(&self) -> bool {
        self.status != AgentStatus::Offline
            && (self.running.len() as u32) < self.max_concurrent_jobs
    }

    pub fn supports(&self, capabilities: &[String]) -> bool {
        capabilities
            .iter()
            .all(|c| self.info.capabilities.iter().any(|have| have == c))
    }

    fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            name: self.info.name.clone(),
            hostname: self.info.hostname.clone(),
            platform: self.info.platform,
            capabilities: self.info.capabilities.clone(),
            version: self.info.version.clone(),
            status: self.status,
            max_concurrent_jobs: self.max_concurrent_jobs,
            current_jobs: self.running.iter().cloned().collect(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Read-only view of an agent for the API.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub name: String,
    pub hostname: String,
    pub platform: fleetci_core::executor::Platform,
    pub capabilities: Vec<String>,
    pub version: String,
    pub status: AgentStatus,
    pub max_concurrent_jobs: u32,
    pub current_jobs: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_id: &str, info: AgentInfo, sender: AgentSender) {
        let now = Utc::now();
        let state = AgentState {
            agent_id: agent_id.to_string(),
            max_concurrent_jobs: info.max_concurrent_jobs,
            info,
            status: AgentStatus::Online,
            running: BTreeSet::new(),
            connected_at: now,
            last_heartbeat: now,
            sender,
        };
        if self.agents.insert(agent_id.to_string(), state).is_some() {
            warn!(agent_id, "Agent re-registered, previous state replaced");
        }
    }

    /// Forget an agent, returning its last state.
    pub fn unregister(&mut self, agent_id: &str) -> Option<AgentState> {
        self.agents.remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn heartbeat(&mut self, agent_id: &str, status: AgentStatus) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        agent.last_heartbeat = Utc::now();
        agent.status = status;
        true
    }

    pub fn has_capacity(&self, agent_id: &str) -> bool {
        self.agents.get(agent_id).is_some_and(AgentState::has_capacity)
    }

    pub fn set_max_concurrent_jobs(&mut self, agent_id: &str, max: u32) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        agent.max_concurrent_jobs = max;
        true
    }

    pub fn job_started(&mut self, agent_id: &str, job_id: &str) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.running.insert(job_id.to_string());
        }
    }

    /// Release a job's slot. Returns whether the agent was running it.
    pub fn job_finished(&mut self, agent_id: &str, job_id: &str) -> bool {
        self.agents
            .get_mut(agent_id)
            .is_some_and(|agent| agent.running.remove(job_id))
    }

    pub fn running_jobs(&self) -> usize {
        self.agents.values().map(|a| a.running.len()).sum()
    }

    /// Pick the capable agent with the most free slots. The result may be
    /// full, in which case the job waits in its queue.
    pub fn select(&self, capabilities: &[String]) -> Option<&str> {
        self.agents
            .values()
            .filter(|a| a.status != AgentStatus::Offline && a.supports(capabilities))
            .min_by(|a, b| {
                let free_a = a.max_concurrent_jobs as i64 - a.running.len() as i64;
                let free_b = b.max_concurrent_jobs as i64 - b.running.len() as i64;
                free_b
                    .cmp(&free_a)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .map(|a| a.agent_id.as_str())
    }

    /// Send to one agent. Returns false if the agent is gone.
    pub fn send(&self, agent_id: &str, message: CoordinatorMessage) -> bool {
        match self.agents.get(agent_id) {
            Some(agent) => agent.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn sender(&self, agent_id: &str) -> Option<AgentSender> {
        self.agents.get(agent_id).map(|a| a.sender.clone())
    }

    pub fn broadcast(&self, message: &CoordinatorMessage) -> usize {
        self.agents
            .values()
            .filter(|a| a.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Mark agents without a heartbeat inside `timeout` offline. Returns
    /// their ids.
    pub fn mark_stale(&mut self, timeout: Duration) -> Vec<String> {
        let cutoff = Utc::now() - timeout;
        let mut stale = Vec::new();
        for agent in self.agents.values_mut() {
            if agent.status != AgentStatus::Offline && agent.last_heartbeat < cutoff {
                debug!(agent_id = %agent.agent_id, "Agent heartbeat expired");
                agent.status = AgentStatus::Offline;
                stale.push(agent.agent_id.clone());
            }
        }
        stale
    }

    pub fn list(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self.agents.values().map(AgentState::summary).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.agent_id.cmp(&b.agent_id)));
        agents
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetci_core::executor::Platform;

    fn info(name: &str, max: u32, caps: &[&str]) -> AgentInfo {
        AgentInfo {
            name: name.into(),
            hostname: "host".into(),
            platform: Platform::Linux,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            max_concurrent_jobs: max,
            version: "test".into(),
        }
    }

    fn register(
        registry: &mut AgentRegistry,
        id: &str,
        max: u32,
        caps: &[&str],
    ) -> mpsc::UnboundedReceiver<CoordinatorMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, info(id, max, caps), tx);
        rx
    }

    #[test]
    fn test_capacity_tracks_running_jobs() {
        let mut registry = AgentRegistry::new();
        let _a = register(&mut registry, "a", 1, &[]);

        assert!(registry.has_capacity("a"));
        registry.job_started("a", "j1");
        assert!(!registry.has_capacity("a"));
        assert!(registry.job_finished("a", "j1"));
        assert!(!registry.job_finished("a", "j1"));
        assert!(registry.has_capacity("a"));
        assert!(!registry.has_capacity("missing"));
    }

    #[test]
    fn test_capacity_change_takes_effect() {
        let mut registry = AgentRegistry::new();
        let _a = register(&mut registry, "a", 1, &[]);
        registry.job_started("a", "j1");
        assert!(!registry.has_capacity("a"));

        registry.set_max_concurrent_jobs("a", 2);
        assert!(registry.has_capacity("a"));
    }

    #[test]
    fn test_select_prefers_free_capable_agent() {
        let mut registry = AgentRegistry::new();
        let _a = register(&mut registry, "a", 2, &["git"]);
        let _b = register(&mut registry, "b", 4, &[]);

        assert_eq!(registry.select(&[]), Some("b"));
        assert_eq!(registry.select(&["git".into()]), Some("a"));
        assert_eq!(registry.select(&["docker".into()]), None);
    }

    #[test]
    fn test_mark_stale() {
        let mut registry = AgentRegistry::new();
        let _a = register(&mut registry, "a", 1, &[]);
        assert!(registry.mark_stale(Duration::seconds(90)).is_empty());

        let stale = registry.mark_stale(Duration::seconds(-1));
        assert_eq!(stale, vec!["a".to_string()]);
        assert!(!registry.has_capacity("a"));

        assert!(registry.heartbeat("a", AgentStatus::Online));
        assert!(registry.has_capacity("a"));
    }

    #[test]
    fn test_send_to_closed_channel() {
        let mut registry = AgentRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("a", info("a", 1, &[]), tx);
        drop(rx);
        assert!(!registry.send("a", CoordinatorMessage::Registered));
        assert!(!registry.send("missing", CoordinatorMessage::Registered));
    }
}
