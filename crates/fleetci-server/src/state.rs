//! Application state.

use fleetci_scheduler::Coordinator;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::ChannelBroadcaster;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub events: ChannelBroadcaster,
    pub agent_tokens: Arc<Vec<String>>,
    /// `None` when running on in-memory storage.
    pub pool: Option<PgPool>,
    /// Cancelled when dashboard connections should be closed.
    pub closing: CancellationToken,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        events: ChannelBroadcaster,
        agent_tokens: Vec<String>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            coordinator,
            events,
            agent_tokens: Arc::new(agent_tokens),
            pool,
            closing: CancellationToken::new(),
        }
    }

    /// Whether `token` is one of the configured agent tokens.
    pub fn accepts_agent_token(&self, token: &str) -> bool {
        !token.is_empty() && self.agent_tokens.iter().any(|t| t == token)
    }
}
