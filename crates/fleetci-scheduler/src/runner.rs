//! Turns a fired trigger into dispatched jobs.
//!
//! The nodes reachable from a trigger run one after another in edge order.
//! The first job goes to any suitable agent and every later one follows it
//! to the same agent, so steps share a work directory. A step that does not
//! complete stops the rest of the chain.

use async_trait::async_trait;
use fleetci_core::job::{
    DependencyInstall, GitCheckout, JobPayload, JobSpec, JobStatus, Priority, RetryPolicy,
};
use fleetci_core::workflow::{Edge, Node, NodeType, TriggerContext, TriggerOutcome, WorkflowRunner};
use fleetci_core::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, SubmitRequest};

/// Job settings shared by every executable node type.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeSettings {
    executor: Option<String>,
    environment: HashMap<String, String>,
    working_directory: Option<String>,
    timeout_seconds: Option<u64>,
    #[serde(flatten)]
    retry: RetryPolicy,
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Commands {
    Many(Vec<String>),
    One(String),
}

/// Build the job for one workflow node.
pub fn job_from_node(
    node: &Node,
    project_id: &str,
    build_number: u64,
) -> Result<(JobSpec, Priority)> {
    let settings: NodeSettings = if node.data.is_null() {
        NodeSettings::default()
    } else {
        serde_json::from_value(node.data.clone())
            .map_err(|e| Error::InvalidInput(format!("node {}: {}", node.id, e)))?
    };

    let field = |name: &str| node.data.get(name).cloned();
    let payload = match node.node_type {
        NodeType::Shell => {
            let commands = field("commands")
                .or_else(|| field("command"))
                .ok_or_else(|| Error::InvalidInput(format!("node {} has no command", node.id)))?;
            let commands = match serde_json::from_value::<Commands>(commands) {
                Ok(Commands::Many(list)) => list,
                Ok(Commands::One(line)) => vec![line],
                Err(e) => return Err(Error::InvalidInput(format!("node {}: {}", node.id, e))),
            };
            JobPayload::Commands { commands }
        }
        NodeType::Script => {
            let body = field("script")
                .or_else(|| field("body"))
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| Error::InvalidInput(format!("node {} has no script", node.id)))?;
            JobPayload::Script { body }
        }
        NodeType::Git => {
            let checkout: GitCheckout = serde_json::from_value(node.data.clone())
                .map_err(|e| Error::InvalidInput(format!("node {}: {}", node.id, e)))?;
            JobPayload::Checkout(checkout)
        }
        NodeType::Dependency => {
            let install: DependencyInstall = serde_json::from_value(node.data.clone())
                .map_err(|e| Error::InvalidInput(format!("node {}: {}", node.id, e)))?;
            JobPayload::Dependencies(install)
        }
        other => {
            return Err(Error::InvalidInput(format!(
                "node {} of type {:?} does not run on agents",
                node.id, other
            )));
        }
    };

    let spec = JobSpec {
        job_id: fleetci_core::id::new_job_id(),
        project_id: project_id.to_string(),
        build_number,
        payload,
        executor: settings.executor,
        environment: settings.environment,
        working_directory: settings.working_directory,
        timeout_seconds: settings.timeout_seconds,
        retry: settings.retry,
        nodes: vec![node.clone()],
    };
    Ok((spec, settings.priority))
}

fn required_capabilities(node: &Node) -> Vec<String> {
    match node.node_type {
        NodeType::Git => vec!["git".to_string()],
        _ => Vec::new(),
    }
}

/// Execution nodes reachable from `trigger`, each placed after every node
/// that feeds it. Nodes caught in a cycle run last, in discovery order.
fn execution_order<'a>(trigger: &str, nodes: &'a [Node], edges: &[Edge]) -> Vec<&'a Node> {
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        downstream
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut reached: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::from([trigger]);
    let mut pending: VecDeque<&str> = VecDeque::from([trigger]);
    while let Some(current) = pending.pop_front() {
        for &next in downstream.get(current).into_iter().flatten() {
            if seen.insert(next) {
                reached.push(next);
                pending.push_back(next);
            }
        }
    }

    let mut incoming: HashMap<&str, usize> = reached.iter().map(|id| (*id, 0)).collect();
    for edge in edges {
        if edge.source == trigger || !incoming.contains_key(edge.source.as_str()) {
            continue;
        }
        if let Some(count) = incoming.get_mut(edge.target.as_str()) {
            *count += 1;
        }
    }

    let mut ready: VecDeque<&str> = reached
        .iter()
        .copied()
        .filter(|id| incoming.get(id) == Some(&0))
        .collect();
    let mut sorted: Vec<&str> = Vec::with_capacity(reached.len());
    while let Some(id) = ready.pop_front() {
        sorted.push(id);
        for &next in downstream.get(id).into_iter().flatten() {
            if let Some(count) = incoming.get_mut(next) {
                *count = count.saturating_sub(1);
                if *count == 0 && !sorted.contains(&next) && !ready.contains(&next) {
                    ready.push_back(next);
                }
            }
        }
    }
    if sorted.len() < reached.len() {
        warn!(trigger, "Workflow contains a cycle");
        let placed: HashSet<&str> = sorted.iter().copied().collect();
        let rest: Vec<&str> = reached
            .iter()
            .copied()
            .filter(|id| !placed.contains(id))
            .collect();
        sorted.extend(rest);
    }

    let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    sorted
        .into_iter()
        .filter_map(|id| by_id.get(id).copied())
        .filter(|node| node.node_type.is_execution_capable())
        .collect()
}

/// One job of a workflow run, ready to submit.
struct Step {
    label: String,
    job: JobSpec,
    priority: Priority,
    capabilities: Vec<String>,
}

impl Step {
    fn request(self, agent_id: Option<String>) -> SubmitRequest {
        SubmitRequest {
            job: self.job,
            agent_id,
            priority: self.priority,
            capabilities: self.capabilities,
        }
    }
}

/// Submit each step once the one before it has completed.
async fn run_chain(
    dispatcher: Arc<Dispatcher>,
    agent_id: String,
    mut job_id: String,
    mut done: oneshot::Receiver<JobStatus>,
    steps: Vec<Step>,
) {
    for step in steps {
        // A dropped sender means the job vanished without a verdict.
        let status = done.await.unwrap_or(JobStatus::Failed);
        if status != JobStatus::Completed {
            warn!(job_id = %job_id, status = %status, skipped = %step.label, "Workflow stopped");
            return;
        }
        let next_id = step.job.job_id.clone();
        let label = step.label.clone();
        match dispatcher.submit_watched(step.request(Some(agent_id.clone()))).await {
            Ok((_, next)) => {
                debug!(job_id = %next_id, agent_id = %agent_id, node = %label, "Next workflow step submitted");
                job_id = next_id;
                done = next;
            }
            Err(e) => {
                warn!(node = %label, agent_id = %agent_id, error = %e, "Failed to submit workflow step");
                return;
            }
        }
    }
}

/// [`WorkflowRunner`] that runs the reachable nodes as a chain of jobs.
pub struct DispatchRunner {
    dispatcher: Arc<Dispatcher>,
    builds: Mutex<HashMap<String, u64>>,
}

impl DispatchRunner {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            builds: Mutex::new(HashMap::new()),
        }
    }

    fn next_build_number(&self, project_id: &str) -> Result<u64> {
        let mut builds = self
            .builds
            .lock()
            .map_err(|_| Error::Internal("build counter poisoned".into()))?;
        let counter = builds.entry(project_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[async_trait]
impl WorkflowRunner for DispatchRunner {
    async fn execute_from_trigger(
        &self,
        project_id: &str,
        nodes: &[Node],
        edges: &[Edge],
        trigger_node_id: &str,
        context: TriggerContext,
    ) -> Result<TriggerOutcome> {
        let ordered = execution_order(trigger_node_id, nodes, edges);
        let build_number = self.next_build_number(project_id)?;
        info!(
            project_id,
            build_number,
            source = %context.source,
            nodes = ordered.len(),
            "Starting workflow"
        );

        let mut steps = Vec::with_capacity(ordered.len());
        for node in ordered {
            match job_from_node(node, project_id, build_number) {
                Ok((job, priority)) => steps.push(Step {
                    label: node.display_label().to_string(),
                    job,
                    priority,
                    capabilities: required_capabilities(node),
                }),
                Err(e) => {
                    warn!(project_id, node = %node.display_label(), error = %e, "Skipping node");
                }
            }
        }

        let failed = TriggerOutcome {
            success: false,
            job_id: None,
            build_number: Some(build_number),
            agent_id: None,
        };
        if steps.is_empty() {
            return Ok(failed);
        }
        let first = steps.remove(0);
        let label = first.label.clone();
        let job_id = first.job.job_id.clone();
        let (outcome, done) = match self.dispatcher.submit_watched(first.request(None)).await {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!(project_id, node = %label, error = %e, "Failed to submit job");
                return Ok(failed);
            }
        };
        let agent_id = outcome.agent_id().to_string();
        if !steps.is_empty() {
            tokio::spawn(run_chain(
                self.dispatcher.clone(),
                agent_id.clone(),
                job_id.clone(),
                done,
                steps,
            ));
        }

        Ok(TriggerOutcome {
            success: true,
            job_id: Some(job_id),
            build_number: Some(build_number),
            agent_id: Some(agent_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetci_core::event::{Broadcaster, Event};
    use fleetci_core::executor::Platform;
    use fleetci_core::protocol::{AgentInfo, AgentMessage, CoordinatorMessage, ExecuteJob};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NullBroadcaster;

    impl Broadcaster for NullBroadcaster {
        fn broadcast_to_project(&self, _project_id: &str, _event: Event) {}
        fn broadcast_to_clients(&self, _event: Event) {}
    }

    fn node(id: &str, node_type: NodeType, data: serde_json::Value) -> Node {
        Node {
            id: id.into(),
            node_type,
            label: None,
            data,
            credentials: vec![],
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.into(),
            target: target.into(),
        }
    }

    fn worker(capabilities: &[&str]) -> AgentInfo {
        AgentInfo {
            name: "worker".into(),
            hostname: "host".into(),
            platform: Platform::Linux,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_concurrent_jobs: 4,
            version: "test".into(),
        }
    }

    fn context() -> TriggerContext {
        TriggerContext {
            source: "manual".into(),
            trigger_node_id: "start".into(),
            cron_expression: None,
            timezone: None,
        }
    }

    fn finished(job_id: &str, exit_code: i32) -> AgentMessage {
        AgentMessage::JobComplete {
            job_id: job_id.into(),
            exit_code,
            output: String::new(),
            duration_ms: 1,
        }
    }

    async fn next_job(rx: &mut mpsc::UnboundedReceiver<CoordinatorMessage>) -> ExecuteJob {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(CoordinatorMessage::ExecuteJob(job))) => job,
            other => panic!("expected execute_job, got {:?}", other),
        }
    }

    /// start -> checkout -> build -> test, with a note hanging off checkout.
    fn pipeline() -> (Vec<Node>, Vec<Edge>) {
        let nodes = vec![
            node("test", NodeType::Shell, serde_json::json!({ "command": "make test" })),
            node("start", NodeType::ManualTrigger, serde_json::json!({})),
            node("build", NodeType::Shell, serde_json::json!({ "command": "make" })),
            node("note", NodeType::Note, serde_json::json!({})),
            node(
                "checkout",
                NodeType::Git,
                serde_json::json!({ "url": "https://example.com/repo.git" }),
            ),
        ];
        let edges = vec![
            edge("start", "checkout"),
            edge("start", "test"),
            edge("build", "test"),
            edge("checkout", "build"),
            edge("checkout", "note"),
        ];
        (nodes, edges)
    }

    #[test]
    fn test_execution_order_follows_edges() {
        let (nodes, edges) = pipeline();
        let order: Vec<&str> = execution_order("start", &nodes, &edges)
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(order, vec!["checkout", "build", "test"]);

        let looped = vec![edge("start", "a"), edge("a", "b"), edge("b", "a")];
        let nodes = vec![
            node("a", NodeType::Shell, serde_json::json!({ "command": "a" })),
            node("b", NodeType::Shell, serde_json::json!({ "command": "b" })),
        ];
        let order: Vec<&str> = execution_order("start", &nodes, &looped)
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_shell_node() {
        let shell = node(
            "build",
            NodeType::Shell,
            serde_json::json!({
                "commands": ["make", "make test"],
                "timeout_seconds": 60,
                "retry_enabled": true,
                "max_retries": 2,
                "priority": "high",
                "environment": { "RUST_LOG": "debug" }
            }),
        );
        let (job, priority) = job_from_node(&shell, "proj", 4).unwrap();
        assert_eq!(
            job.payload,
            JobPayload::Commands {
                commands: vec!["make".into(), "make test".into()]
            }
        );
        assert_eq!(priority, Priority::High);
        assert_eq!(job.build_number, 4);
        assert_eq!(job.timeout_seconds, Some(60));
        assert_eq!(job.retry.max_attempts(), 3);
        assert_eq!(job.environment["RUST_LOG"], "debug");
        assert_eq!(job.nodes.len(), 1);
    }

    #[test]
    fn test_single_command_and_script() {
        let shell = node("a", NodeType::Shell, serde_json::json!({ "command": "ls" }));
        let (job, _) = job_from_node(&shell, "p", 1).unwrap();
        assert_eq!(job.payload, JobPayload::Commands { commands: vec!["ls".into()] });

        let script = node(
            "b",
            NodeType::Script,
            serde_json::json!({ "script": "print('hi')", "executor": "python3" }),
        );
        let (job, _) = job_from_node(&script, "p", 1).unwrap();
        assert_eq!(job.executor.as_deref(), Some("python3"));
        assert!(matches!(job.payload, JobPayload::Script { .. }));
    }

    #[test]
    fn test_git_and_unsupported_nodes() {
        let git = node(
            "checkout",
            NodeType::Git,
            serde_json::json!({ "url": "https://example.com/repo.git", "shallow": true }),
        );
        let (job, _) = job_from_node(&git, "p", 1).unwrap();
        match job.payload {
            JobPayload::Checkout(checkout) => {
                assert!(checkout.shallow);
                assert_eq!(checkout.target_dir, "source");
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let notify = node("n", NodeType::Notify, serde_json::json!({}));
        assert!(job_from_node(&notify, "p", 1).is_err());
        let empty = node("s", NodeType::Shell, serde_json::json!({}));
        assert!(job_from_node(&empty, "p", 1).is_err());
    }

    #[tokio::test]
    async fn test_execute_from_trigger_submits_reachable_nodes() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(NullBroadcaster)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .agent_connected(
                "agent-1",
                AgentInfo {
                    name: "worker".into(),
                    hostname: "host".into(),
                    platform: Platform::Linux,
                    capabilities: vec![],
                    max_concurrent_jobs: 4,
                    version: "test".into(),
                },
                tx,
            )
            .await;

        let runner = DispatchRunner::new(dispatcher);
        let nodes = vec![
            node("cron", NodeType::CronTrigger, serde_json::json!({ "cron_expression": "* * * * *" })),
            node("build", NodeType::Shell, serde_json::json!({ "command": "make" })),
            node("note", NodeType::Note, serde_json::json!({})),
            node("unlinked", NodeType::Shell, serde_json::json!({ "command": "true" })),
        ];
        let edges = vec![edge("cron", "build"), edge("cron", "note")];
        let context = TriggerContext {
            source: "cron".into(),
            trigger_node_id: "cron".into(),
            cron_expression: None,
            timezone: None,
        };

        let outcome = runner
            .execute_from_trigger("proj", &nodes, &edges, "cron", context.clone())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.build_number, Some(1));
        assert_eq!(outcome.agent_id.as_deref(), Some("agent-1"));

        let mut sent = Vec::new();
        while let Ok(CoordinatorMessage::ExecuteJob(job)) = rx.try_recv() {
            sent.push(job.spec.nodes[0].id.clone());
        }
        assert_eq!(sent, vec!["build".to_string()]);

        let second = runner
            .execute_from_trigger("proj", &nodes, &edges, "cron", context)
            .await
            .unwrap();
        assert_eq!(second.build_number, Some(2));
    }

    #[tokio::test]
    async fn test_checkout_then_shell_run_in_order_on_one_agent() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(NullBroadcaster)));
        let (git_tx, mut git_rx) = mpsc::unbounded_channel();
        dispatcher
            .agent_connected("agent-git", worker(&["git"]), git_tx)
            .await;
        let (plain_tx, mut plain_rx) = mpsc::unbounded_channel();
        dispatcher
            .agent_connected("agent-plain", worker(&[]), plain_tx)
            .await;

        let runner = DispatchRunner::new(dispatcher.clone());
        let nodes = vec![
            node("start", NodeType::ManualTrigger, serde_json::json!({})),
            node(
                "checkout",
                NodeType::Git,
                serde_json::json!({ "url": "https://example.com/repo.git" }),
            ),
            node("build", NodeType::Shell, serde_json::json!({ "command": "make -C source" })),
        ];
        let edges = vec![edge("start", "checkout"), edge("checkout", "build")];
        let outcome = runner
            .execute_from_trigger("proj", &nodes, &edges, "start", context())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.agent_id.as_deref(), Some("agent-git"));

        let checkout = next_job(&mut git_rx).await;
        assert_eq!(checkout.spec.nodes[0].id, "checkout");
        assert_eq!(outcome.job_id.as_deref(), Some(checkout.spec.job_id.as_str()));
        assert!(git_rx.try_recv().is_err());

        dispatcher
            .handle_agent_message("agent-git", finished(&checkout.spec.job_id, 0))
            .await;
        let build = next_job(&mut git_rx).await;
        assert_eq!(build.spec.nodes[0].id, "build");
        assert_eq!(build.spec.build_number, checkout.spec.build_number);
        assert!(plain_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_step_stops_the_chain() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(NullBroadcaster)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .agent_connected("agent-1", worker(&["git"]), tx)
            .await;

        let runner = DispatchRunner::new(dispatcher.clone());
        let (nodes, edges) = pipeline();
        runner
            .execute_from_trigger("proj", &nodes, &edges, "start", context())
            .await
            .unwrap();

        let checkout = next_job(&mut rx).await;
        dispatcher
            .handle_agent_message("agent-1", finished(&checkout.spec.job_id, 0))
            .await;
        let build = next_job(&mut rx).await;
        assert_eq!(build.spec.nodes[0].id, "build");
        dispatcher
            .handle_agent_message("agent-1", finished(&build.spec.job_id, 2))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.running_job_count().await, 0);
    }
}
