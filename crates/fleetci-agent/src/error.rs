//! Agent error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("coordinator closed the connection")]
    Closed,

    #[error("handshake timed out")]
    Timeout,
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
