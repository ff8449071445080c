//! The agent's connection to its coordinator.
//!
//! An [`Agent`] keeps one execution engine for its whole life and a
//! WebSocket session that is re-established whenever it drops. Every session
//! registers under a new agent id and the coordinator fails the jobs of a
//! session that went away, so losing a session stops the jobs it started and
//! discards their unsent reports before reconnecting.
//!
//! A `shutdown` notice does not end the session: jobs keep reporting until the
//! coordinator closes the connection.

use fleetci_config::AgentConfig;
use fleetci_core::executor::{Platform, platform_capabilities};
use fleetci_core::protocol::{AgentInfo, AgentMessage, AgentStatus, CoordinatorMessage};
use fleetci_executor::{EngineConfig, ExecutionEngine};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{AgentError, AgentResult};

/// How long the coordinator has to answer each handshake step.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long running jobs get to stop when the agent exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Stream = SplitStream<Socket>;

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The agent was asked to stop.
    Stopped,
    /// The coordinator went away; reconnect.
    Disconnected,
}

pub struct Agent {
    config: AgentConfig,
    info: AgentInfo,
    engine: ExecutionEngine,
    events: mpsc::UnboundedReceiver<AgentMessage>,
    backoff: Backoff,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let info = agent_info(&config);
        let (tx, events) = mpsc::unbounded_channel();
        let mut engine_config =
            EngineConfig::new(config.work_dir.clone(), info.capabilities.clone());
        engine_config.max_jobs = Some(config.max_concurrent_jobs as usize);
        let engine = ExecutionEngine::new(engine_config, tx);
        Self {
            config,
            info,
            engine,
            events,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    /// Stay connected until `cancel` fires, then stop every job.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            match self.session(&cancel).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Disconnected) => info!("Disconnected from coordinator"),
                Err(e) => warn!(error = %e, "Coordinator session failed"),
            }
            self.abandon_jobs().await;

            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to coordinator");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.stop_jobs().await;
    }

    /// Stop the jobs of a lost session and drop whatever they still had to
    /// report. The coordinator has already settled them.
    async fn abandon_jobs(&mut self) {
        self.stop_jobs().await;
        let mut discarded = 0;
        while self.events.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(reports = discarded, "Discarded reports from the lost session");
        }
    }

    async fn stop_jobs(&self) {
        let cancelled = self.engine.cancel_all();
        if cancelled == 0 {
            return;
        }
        info!(jobs = cancelled, "Stopping running jobs");
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.engine.running_jobs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let left = self.engine.running_jobs();
        if left > 0 {
            warn!(jobs = left, "Jobs still running after cancellation");
        }
    }

    /// Connect, authenticate, register and serve until the connection ends.
    pub async fn session(&mut self, cancel: &CancellationToken) -> AgentResult<SessionEnd> {
        let url = self.config.coordinator.as_str();
        let socket = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Stopped),
            connected = connect_async(url) => connected?.0,
        };
        let (mut sink, mut stream) = socket.split();

        let agent_id = handshake(&mut sink, &mut stream, &self.config.token, &self.info).await?;
        self.backoff.reset();
        info!(agent_id = %agent_id, coordinator = %url, "Registered with coordinator");

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let engine = &self.engine;
        let events = &mut self.events;
        let max_jobs = self.info.max_concurrent_jobs;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = heartbeat.tick() => {
                    send(&mut sink, &heartbeat_message(engine.running_jobs(), max_jobs)).await?;
                }
                Some(report) = events.recv() => {
                    send(&mut sink, &report).await?;
                }
                frame = stream.next() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => return Ok(SessionEnd::Disconnected),
                    };
                    match frame {
                        Message::Text(text) => match serde_json::from_str(&text) {
                            Ok(message) => handle_message(engine, message),
                            Err(e) => warn!(error = %e, "Malformed coordinator message"),
                        },
                        Message::Close(_) => return Ok(SessionEnd::Disconnected),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Apply one coordinator message.
pub fn handle_message(engine: &ExecutionEngine, message: CoordinatorMessage) {
    match message {
        CoordinatorMessage::ExecuteJob(job) => {
            info!(job_id = %job.spec.job_id, build = job.spec.build_number, "Job received");
            engine.spawn(job);
        }
        CoordinatorMessage::CancelJob { job_id } => {
            engine.cancel_job(&job_id);
        }
        CoordinatorMessage::Shutdown { reason } => {
            info!(
                reason = %reason,
                running = engine.running_jobs(),
                "Coordinator is shutting down, waiting for it to close the connection"
            );
        }
        CoordinatorMessage::Error { message } => {
            warn!(message = %message, "Coordinator reported an error");
        }
        other => debug!(message = ?other, "Ignoring handshake message on an open session"),
    }
}

pub fn heartbeat_message(running: usize, max_jobs: u32) -> AgentMessage {
    let current_jobs = u32::try_from(running).unwrap_or(u32::MAX);
    let status = if current_jobs >= max_jobs {
        AgentStatus::Busy
    } else {
        AgentStatus::Online
    };
    AgentMessage::Heartbeat {
        status,
        current_jobs,
    }
}

async fn handshake(
    sink: &mut Sink,
    stream: &mut Stream,
    token: &str,
    info: &AgentInfo,
) -> AgentResult<String> {
    match expect(stream).await? {
        CoordinatorMessage::Welcome { version } => {
            debug!(coordinator_version = %version, "Coordinator welcome");
        }
        other => return Err(unexpected("welcome", &other)),
    }

    send(
        sink,
        &AgentMessage::Authenticate {
            token: token.to_string(),
        },
    )
    .await?;
    let agent_id = match expect(stream).await? {
        CoordinatorMessage::Authenticated { agent_id } => agent_id,
        CoordinatorMessage::AuthFailed { reason } => return Err(AgentError::AuthFailed(reason)),
        other => return Err(unexpected("authenticated", &other)),
    };

    send(
        sink,
        &AgentMessage::Register {
            agent_info: info.clone(),
        },
    )
    .await?;
    match expect(stream).await? {
        CoordinatorMessage::Registered => Ok(agent_id),
        other => Err(unexpected("registered", &other)),
    }
}

fn unexpected(wanted: &str, got: &CoordinatorMessage) -> AgentError {
    AgentError::Protocol(format!("expected {}, got {:?}", wanted, got))
}

async fn expect(stream: &mut Stream) -> AgentResult<CoordinatorMessage> {
    loop {
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next())
            .await
            .map_err(|_| AgentError::Timeout)?
            .ok_or(AgentError::Closed)??;
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| AgentError::Protocol(format!("malformed message: {}", e)));
            }
            Message::Close(_) => return Err(AgentError::Closed),
            _ => continue,
        }
    }
}

async fn send(sink: &mut Sink, message: &AgentMessage) -> AgentResult<()> {
    let json = serde_json::to_string(message)
        .map_err(|e| AgentError::Protocol(format!("encode failed: {}", e)))?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// What this host reports when it registers.
pub fn agent_info(config: &AgentConfig) -> AgentInfo {
    let platform = Platform::current();
    let mut capabilities = platform_capabilities(platform);
    capabilities.extend(config.capabilities.iter().cloned());
    capabilities.sort();
    capabilities.dedup();

    AgentInfo {
        name: config.name.clone(),
        hostname: hostname().unwrap_or_else(|| config.name.clone()),
        platform,
        capabilities,
        max_concurrent_jobs: config.max_concurrent_jobs,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetci_core::job::{JobPayload, JobSpec, RetryPolicy};
    use fleetci_core::protocol::{ExecuteJob, JobStatusUpdate};
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn config(coordinator: &str, work_dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            coordinator: coordinator.parse().unwrap(),
            token: "t0ken".into(),
            name: "test-agent".into(),
            max_concurrent_jobs: 2,
            capabilities: vec!["docker".into()],
            work_dir: work_dir.to_path_buf(),
            heartbeat_interval_secs: 1,
            log_format: fleetci_config::LogFormat::Text,
        }
    }

    async fn recv_agent<S>(socket: &mut S) -> AgentMessage
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn frame(message: &CoordinatorMessage) -> Message {
        Message::Text(serde_json::to_string(message).unwrap().into())
    }

    #[test]
    fn test_heartbeat_status() {
        match heartbeat_message(0, 2) {
            AgentMessage::Heartbeat {
                status,
                current_jobs,
            } => {
                assert_eq!(status, AgentStatus::Online);
                assert_eq!(current_jobs, 0);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(matches!(
            heartbeat_message(2, 2),
            AgentMessage::Heartbeat {
                status: AgentStatus::Busy,
                ..
            }
        ));
    }

    #[test]
    fn test_agent_info_merges_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let info = agent_info(&config("ws://127.0.0.1:1/agent/ws", dir.path()));
        assert!(info.capabilities.contains(&"docker".to_string()));
        assert!(!info.hostname.is_empty());
        assert_eq!(info.max_concurrent_jobs, 2);
        let mut sorted = info.capabilities.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, info.capabilities);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_reports_cancel_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::new(config("ws://127.0.0.1:1/agent/ws", dir.path()));
        handle_message(
            &agent.engine,
            CoordinatorMessage::CancelJob {
                job_id: "job-missing".into(),
            },
        );
        match agent.events.recv().await.unwrap() {
            AgentMessage::JobStatus { job_id, status, .. } => {
                assert_eq!(job_id, "job-missing");
                assert_eq!(status, JobStatusUpdate::CancelFailed);
            }
            other => panic!("unexpected message {:?}", other),
        }

        handle_message(
            &agent.engine,
            CoordinatorMessage::Shutdown {
                reason: "restart".into(),
            },
        );
        assert!(agent.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auth_failure_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(tcp).await.unwrap();
            socket
                .send(frame(&CoordinatorMessage::Welcome {
                    version: "test".into(),
                }))
                .await
                .unwrap();
            let _ = recv_agent(&mut socket).await;
            socket
                .send(frame(&CoordinatorMessage::AuthFailed {
                    reason: "invalid token".into(),
                }))
                .await
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::new(config(&format!("ws://{}/agent/ws", addr), dir.path()));
        let result = agent.session(&CancellationToken::new()).await;
        match result {
            Err(AgentError::AuthFailed(reason)) => assert_eq!(reason, "invalid token"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    /// Accept one agent connection and complete the handshake.
    async fn accept_agent(
        listener: &TcpListener,
        agent_id: &str,
    ) -> WebSocketStream<TcpStream> {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(tcp).await.unwrap();
        socket
            .send(frame(&CoordinatorMessage::Welcome {
                version: "test".into(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            recv_agent(&mut socket).await,
            AgentMessage::Authenticate { .. }
        ));
        socket
            .send(frame(&CoordinatorMessage::Authenticated {
                agent_id: agent_id.into(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            recv_agent(&mut socket).await,
            AgentMessage::Register { .. }
        ));
        socket
            .send(frame(&CoordinatorMessage::Registered))
            .await
            .unwrap();
        socket
    }

    fn long_job(job_id: &str) -> CoordinatorMessage {
        CoordinatorMessage::ExecuteJob(ExecuteJob {
            spec: JobSpec {
                job_id: job_id.into(),
                project_id: "proj".into(),
                build_number: 1,
                payload: JobPayload::Commands {
                    commands: vec!["echo started".into(), "sleep 30".into()],
                },
                executor: None,
                environment: HashMap::new(),
                working_directory: None,
                timeout_seconds: None,
                retry: RetryPolicy::default(),
                nodes: vec![],
            },
            mask_values: vec![],
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lost_session_stops_its_jobs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(config(&format!("ws://{}/agent/ws", addr), dir.path()))
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(100)));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(agent.run(cancel.clone()));

        let mut first = accept_agent(&listener, "agent-1").await;
        first.send(frame(&long_job("job-old"))).await.unwrap();
        loop {
            if let AgentMessage::JobOutput { job_id, .. } = recv_agent(&mut first).await {
                assert_eq!(job_id, "job-old");
                break;
            }
        }
        drop(first);

        // The next session starts with no jobs and nothing left over.
        let mut second = accept_agent(&listener, "agent-2").await;
        loop {
            match recv_agent(&mut second).await {
                AgentMessage::Heartbeat { current_jobs, .. } => {
                    assert_eq!(current_jobs, 0);
                    break;
                }
                other => panic!("report leaked into the new session: {:?}", other),
            }
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_runs_jobs_and_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(config(&format!("ws://{}/agent/ws", addr), dir.path()))
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(100)));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(agent.run(cancel.clone()));

        let (tcp, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(tcp).await.unwrap();
        socket
            .send(frame(&CoordinatorMessage::Welcome {
                version: "test".into(),
            }))
            .await
            .unwrap();
        match recv_agent(&mut socket).await {
            AgentMessage::Authenticate { token } => assert_eq!(token, "t0ken"),
            other => panic!("unexpected message {:?}", other),
        }
        socket
            .send(frame(&CoordinatorMessage::Authenticated {
                agent_id: "agent-1".into(),
            }))
            .await
            .unwrap();
        match recv_agent(&mut socket).await {
            AgentMessage::Register { agent_info } => assert_eq!(agent_info.name, "test-agent"),
            other => panic!("unexpected message {:?}", other),
        }
        socket
            .send(frame(&CoordinatorMessage::Registered))
            .await
            .unwrap();

        socket
            .send(frame(&CoordinatorMessage::ExecuteJob(ExecuteJob {
                spec: JobSpec {
                    job_id: "job-echo".into(),
                    project_id: "proj".into(),
                    build_number: 1,
                    payload: JobPayload::Commands {
                        commands: vec!["echo fleet".into()],
                    },
                    executor: None,
                    environment: HashMap::new(),
                    working_directory: None,
                    timeout_seconds: Some(30),
                    retry: RetryPolicy::default(),
                    nodes: vec![],
                },
                mask_values: vec![],
            })))
            .await
            .unwrap();

        let mut saw_heartbeat = false;
        let mut saw_output = false;
        loop {
            match recv_agent(&mut socket).await {
                AgentMessage::Heartbeat { .. } => saw_heartbeat = true,
                AgentMessage::JobOutput { job_id, output } => {
                    assert_eq!(job_id, "job-echo");
                    if output.message.contains("fleet") {
                        saw_output = true;
                    }
                }
                AgentMessage::JobComplete {
                    job_id, exit_code, ..
                } => {
                    assert_eq!(job_id, "job-echo");
                    assert_eq!(exit_code, 0);
                    break;
                }
                AgentMessage::JobStatus { .. } => {}
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(saw_heartbeat);
        assert!(saw_output);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
    }
}
