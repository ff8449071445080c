//! Workflow graph model and the workflow-execution entry point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::Result;
use crate::credential::CredentialBinding;

/// Type of a node in a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    CronTrigger,
    WebhookTrigger,
    ManualTrigger,
    Shell,
    Script,
    Git,
    Dependency,
    Docker,
    Http,
    Notify,
    Note,
    #[serde(other)]
    Unknown,
}

impl NodeType {
    /// Whether a node of this type does work when reached.
    pub fn is_execution_capable(&self) -> bool {
        matches!(
            self,
            NodeType::Shell
                | NodeType::Script
                | NodeType::Git
                | NodeType::Dependency
                | NodeType::Docker
                | NodeType::Http
                | NodeType::Notify
        )
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub label: Option<String>,
    /// Type-specific configuration.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Credentials this node wants injected into its environment.
    #[serde(default)]
    pub credentials: Vec<CredentialBinding>,
}

impl Node {
    /// The cron expression of a cron-trigger node, if set and non-empty.
    pub fn cron_expression(&self) -> Option<&str> {
        if self.node_type != NodeType::CronTrigger {
            return None;
        }
        self.data
            .get("cron_expression")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

/// Collect every execution-capable node reachable from `start` by following
/// edges forward. The start node itself is not included. Order is BFS order.
pub fn reachable_execution_nodes<'a>(
    start: &str,
    nodes: &'a [Node],
    edges: &[Edge],
) -> Vec<&'a Node> {
    let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut found = Vec::new();

    visited.insert(start);
    queue.push_back(start);

    while let Some(current) = queue.pop_front() {
        for &next in adjacency.get(current).into_iter().flatten() {
            if !visited.insert(next) {
                continue;
            }
            if let Some(node) = by_id.get(next) {
                if node.node_type.is_execution_capable() {
                    found.push(*node);
                }
            }
            queue.push_back(next);
        }
    }

    found
}

/// Context passed to the workflow runner when a trigger fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    /// What fired the trigger, e.g. `cron`.
    pub source: String,
    pub trigger_node_id: String,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Result of starting a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub success: bool,
    pub job_id: Option<String>,
    pub build_number: Option<u64>,
    pub agent_id: Option<String>,
}

/// Entry point that turns a fired trigger into jobs.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn execute_from_trigger(
        &self,
        project_id: &str,
        nodes: &[Node],
        edges: &[Edge],
        trigger_node_id: &str,
        context: TriggerContext,
    ) -> Result<TriggerOutcome>;
}
