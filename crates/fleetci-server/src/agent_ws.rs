//! The agent channel.
//!
//! Handshake: the coordinator sends `welcome`, the agent answers with
//! `authenticate` and then `register`. Only after `registered` is the agent
//! handed to the dispatcher, which may immediately start sending jobs.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use fleetci_core::protocol::{AgentInfo, AgentMessage, CoordinatorMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

/// How long an agent has to finish each handshake step.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Sink = SplitSink<WebSocket, Message>;
type Stream = SplitStream<WebSocket>;

/// WebSocket upgrade handler for agents.
pub async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_agent(socket, state))
}

async fn handle_agent(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let welcome = CoordinatorMessage::Welcome {
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if !send_frame(&mut sink, &welcome).await {
        return;
    }

    let Some((agent_id, info)) = handshake(&state, &mut sink, &mut stream).await else {
        let _ = sink.close().await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<CoordinatorMessage>();
    let dispatcher = state.coordinator.dispatcher().clone();
    dispatcher.agent_connected(&agent_id, info, tx).await;

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                // The dispatcher drops the sender when it closes the session.
                let Some(message) = outgoing else { break };
                if !send_frame(&mut sink, &message).await {
                    break;
                }
            }
            incoming = stream.next() => {
                let Some(frame) = incoming else { break };
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<AgentMessage>(&text) {
                        Ok(message) => dispatcher.handle_agent_message(&agent_id, message).await,
                        Err(e) => {
                            warn!(agent_id = %agent_id, error = %e, "Malformed agent message");
                            let reply = CoordinatorMessage::Error {
                                message: format!("malformed message: {}", e),
                            };
                            if !send_frame(&mut sink, &reply).await {
                                break;
                            }
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Agent WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Flush whatever the dispatcher queued before it let go, such as a
    // shutdown notice.
    while let Ok(message) = rx.try_recv() {
        if !send_frame(&mut sink, &message).await {
            break;
        }
    }
    let _ = sink.close().await;
    dispatcher.agent_disconnected(&agent_id).await;
}

/// Run the authenticate/register exchange. Returns the assigned agent id and
/// the registered info, or `None` if the agent was turned away.
async fn handshake(
    state: &AppState,
    sink: &mut Sink,
    stream: &mut Stream,
) -> Option<(String, AgentInfo)> {
    let token = match next_message(stream).await? {
        AgentMessage::Authenticate { token } => token,
        other => {
            debug!(message = ?other, "Expected authenticate");
            reject(sink, "authenticate first").await;
            return None;
        }
    };
    if !state.coordinator.dispatcher().is_accepting() {
        reject(sink, "coordinator is shutting down").await;
        return None;
    }
    if !state.accepts_agent_token(&token) {
        warn!("Agent presented an invalid token");
        reject(sink, "invalid token").await;
        return None;
    }

    let agent_id = fleetci_core::id::new_agent_id();
    let authenticated = CoordinatorMessage::Authenticated {
        agent_id: agent_id.clone(),
    };
    if !send_frame(sink, &authenticated).await {
        return None;
    }

    let info = match next_message(stream).await? {
        AgentMessage::Register { agent_info } => agent_info,
        other => {
            debug!(agent_id = %agent_id, message = ?other, "Expected register");
            let error = CoordinatorMessage::Error {
                message: "register expected".into(),
            };
            send_frame(sink, &error).await;
            return None;
        }
    };
    if !send_frame(sink, &CoordinatorMessage::Registered).await {
        return None;
    }
    info!(
        agent_id = %agent_id,
        name = %info.name,
        hostname = %info.hostname,
        platform = ?info.platform,
        "Agent authenticated"
    );
    Some((agent_id, info))
}

async fn reject(sink: &mut Sink, reason: &str) {
    let failed = CoordinatorMessage::AuthFailed {
        reason: reason.to_string(),
    };
    send_frame(sink, &failed).await;
}

/// Next protocol message, skipping control frames. `None` on close, error,
/// undecodable input or timeout.
async fn next_message(stream: &mut Stream) -> Option<AgentMessage> {
    loop {
        let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Agent WebSocket error during handshake");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                warn!("Agent handshake timed out");
                return None;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str(&text) {
                Ok(message) => return Some(message),
                Err(e) => {
                    warn!(error = %e, "Malformed handshake message");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Returns false once the agent is gone.
async fn send_frame(sink: &mut Sink, message: &CoordinatorMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode agent message");
            return true;
        }
    };
    sink.send(Message::Text(json.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelBroadcaster;
    use crate::routes;
    use fleetci_core::executor::Platform;
    use fleetci_core::job::{JobPayload, JobSpec, RetryPolicy};
    use fleetci_db::{MemoryCronStore, MemorySettingsStore};
    use fleetci_scheduler::{
        Coordinator, CoordinatorParts, ShutdownOptions, SubmitOutcome, SubmitRequest,
    };
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsFrame;

    async fn serve() -> (SocketAddr, Arc<Coordinator>, ChannelBroadcaster) {
        let events = ChannelBroadcaster::default();
        let coordinator = Arc::new(Coordinator::new(CoordinatorParts {
            cron_store: Arc::new(MemoryCronStore::new()),
            settings: Arc::new(MemorySettingsStore::new()),
            broadcaster: Arc::new(events.clone()),
            credentials: None,
            runner: None,
            default_timezone: chrono_tz::Tz::UTC,
            heartbeat_timeout: Duration::from_secs(90),
        }));
        let state = AppState::new(coordinator.clone(), events.clone(), vec!["t0ken".into()], None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, routes::router(state)).await.unwrap();
        });
        (addr, coordinator, events)
    }

    async fn recv<S>(socket: &mut S) -> CoordinatorMessage
    where
        S: futures::Stream<Item = Result<WsFrame, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsFrame::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn frame(message: &AgentMessage) -> WsFrame {
        WsFrame::Text(serde_json::to_string(message).unwrap().into())
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejected() {
        let (addr, coordinator, _) = serve().await;
        let (mut socket, _) = connect_async(format!("ws://{}/agent/ws", addr)).await.unwrap();

        assert!(matches!(recv(&mut socket).await, CoordinatorMessage::Welcome { .. }));
        socket
            .send(frame(&AgentMessage::Authenticate {
                token: "wrong".into(),
            }))
            .await
            .unwrap();
        match recv(&mut socket).await {
            CoordinatorMessage::AuthFailed { reason } => assert_eq!(reason, "invalid token"),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(coordinator.dispatcher().agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_registered_agent_receives_jobs() {
        let (addr, coordinator, _) = serve().await;
        let (mut socket, _) = connect_async(format!("ws://{}/agent/ws", addr)).await.unwrap();

        assert!(matches!(recv(&mut socket).await, CoordinatorMessage::Welcome { .. }));
        socket
            .send(frame(&AgentMessage::Authenticate {
                token: "t0ken".into(),
            }))
            .await
            .unwrap();
        let agent_id = match recv(&mut socket).await {
            CoordinatorMessage::Authenticated { agent_id } => agent_id,
            other => panic!("unexpected message {:?}", other),
        };
        socket
            .send(frame(&AgentMessage::Register {
                agent_info: AgentInfo {
                    name: "worker".into(),
                    hostname: "host".into(),
                    platform: Platform::Linux,
                    capabilities: vec!["bash".into()],
                    max_concurrent_jobs: 1,
                    version: "test".into(),
                },
            }))
            .await
            .unwrap();
        assert!(matches!(recv(&mut socket).await, CoordinatorMessage::Registered));

        // Registration completes on the server task after `registered` is sent.
        for _ in 0..50 {
            if !coordinator.dispatcher().agents().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let outcome = coordinator
            .dispatcher()
            .submit(SubmitRequest {
                job: JobSpec {
                    job_id: "job-ws".into(),
                    project_id: "proj".into(),
                    build_number: 1,
                    payload: JobPayload::Commands {
                        commands: vec!["echo hi".into()],
                    },
                    executor: None,
                    environment: HashMap::new(),
                    working_directory: None,
                    timeout_seconds: None,
                    retry: RetryPolicy::default(),
                    nodes: vec![],
                },
                agent_id: None,
                priority: Default::default(),
                capabilities: vec![],
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Dispatched {
                job_id: "job-ws".into(),
                agent_id: agent_id.clone(),
            }
        );
        match recv(&mut socket).await {
            CoordinatorMessage::ExecuteJob(job) => assert_eq!(job.spec.job_id, "job-ws"),
            other => panic!("unexpected message {:?}", other),
        }

        socket.close(None).await.unwrap();
        for _ in 0..50 {
            if coordinator.dispatcher().agents().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(coordinator.dispatcher().agents().await.is_empty());
        assert!(coordinator.dispatcher().job("job-ws").await.is_none());
    }

    fn shell_job(job_id: &str, commands: &[&str]) -> JobSpec {
        JobSpec {
            job_id: job_id.into(),
            project_id: "proj".into(),
            build_number: 1,
            payload: JobPayload::Commands {
                commands: commands.iter().map(|c| c.to_string()).collect(),
            },
            executor: None,
            environment: HashMap::new(),
            working_directory: None,
            timeout_seconds: Some(30),
            retry: RetryPolicy::default(),
            nodes: vec![],
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_waits_for_jobs_on_a_live_agent() {
        use fleetci_agent::{Agent, Backoff};
        use fleetci_core::event::Event;
        use fleetci_core::job::JobStatus;
        use tokio_util::sync::CancellationToken;

        let (addr, coordinator, events) = serve().await;
        let mut updates = events.subscribe();
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(fleetci_config::AgentConfig {
            coordinator: format!("ws://{}/agent/ws", addr).parse().unwrap(),
            token: "t0ken".into(),
            name: "live-agent".into(),
            max_concurrent_jobs: 1,
            capabilities: vec![],
            work_dir: dir.path().to_path_buf(),
            heartbeat_interval_secs: 1,
            log_format: fleetci_config::LogFormat::Text,
        })
        .with_backoff(Backoff::new(Duration::from_millis(50), Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(agent.run(cancel.clone()));

        for _ in 0..100 {
            if !coordinator.dispatcher().agents().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        coordinator
            .dispatcher()
            .submit(SubmitRequest {
                job: shell_job("job-slow", &["sleep 2", "echo done"]),
                agent_id: None,
                priority: Default::default(),
                capabilities: vec![],
            })
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let report = coordinator
            .stop(ShutdownOptions {
                reason: "restart".into(),
                wait_for_jobs: true,
                force: false,
                drain_timeout: Duration::from_secs(20),
                poll_interval: Duration::from_millis(100),
            })
            .await
            .unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert!(started.elapsed() >= Duration::from_millis(1500));

        let mut statuses = Vec::new();
        while let Ok(envelope) = updates.try_recv() {
            if let Event::JobStatusChanged { job_id, status, .. } = envelope.event {
                if job_id == "job-slow" {
                    statuses.push(status);
                }
            }
        }
        assert_eq!(statuses.last(), Some(&JobStatus::Completed));
        assert!(!statuses.contains(&JobStatus::Failed));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
    }
}
