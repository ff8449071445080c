//! WebSocket handling for dashboard clients.
//!
//! Clients receive every event by default. Subscribing to one or more
//! projects narrows project-scoped events to those projects; global events
//! are always delivered.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use fleetci_core::event::Event;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::broadcast::Envelope;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("Client WebSocket connection established");
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();
    let mut projects: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = state.closing.cancelled() => break,
            incoming = stream.next() => {
                let Some(msg) = incoming else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) else {
                            debug!("Ignoring malformed client command");
                            continue;
                        };
                        let reply = apply_command(cmd, &mut projects);
                        if !send_json(&mut sink, &reply).await {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!(error = %e, "Client WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
            received = events.recv() => {
                match received {
                    Ok(envelope) => {
                        if !envelope.visible_to(&projects) {
                            continue;
                        }
                        if !send_json(&mut sink, &WsMessage::from(envelope)).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Client fell behind, events dropped");
                        let notice = WsMessage::Lagged { skipped };
                        if !send_json(&mut sink, &notice).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    let _ = sink.close().await;
    info!("Client WebSocket connection closed");
}

/// Returns false once the client is gone.
async fn send_json(sink: &mut SplitSink<WebSocket, Message>, message: &WsMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode client message");
            return true;
        }
    };
    sink.send(Message::Text(json.into())).await.is_ok()
}

fn apply_command(cmd: WsCommand, projects: &mut HashSet<String>) -> WsMessage {
    match cmd {
        WsCommand::Subscribe { project_id } => {
            debug!(project_id = %project_id, "Client subscribed");
            projects.insert(project_id.clone());
            WsMessage::Subscribed { project_id }
        }
        WsCommand::Unsubscribe { project_id } => {
            debug!(project_id = %project_id, "Client unsubscribed");
            projects.remove(&project_id);
            WsMessage::Unsubscribed { project_id }
        }
        WsCommand::Ping => WsMessage::Pong,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Subscribe { project_id: String },
    Unsubscribe { project_id: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    Subscribed { project_id: String },
    Unsubscribed { project_id: String },
    Pong,
    Lagged { skipped: u64 },
    Event { event: Event },
}

impl From<Envelope> for WsMessage {
    fn from(envelope: Envelope) -> Self {
        WsMessage::Event {
            event: envelope.event,
        }
    }
}
