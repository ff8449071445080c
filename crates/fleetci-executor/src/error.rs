//! Executor error types.

use fleetci_core::executor::ResolveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("executor {executor} cannot run a {payload} payload")]
    PayloadMismatch { executor: String, payload: String },

    #[error("working directory {0:?} must be a relative path inside the agent work root")]
    WorkingDirectory(String),

    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Configuration problems are reported once and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ExecutorError::Resolve(_)
                | ExecutorError::PayloadMismatch { .. }
                | ExecutorError::WorkingDirectory(_)
        )
    }
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
