//! Job execution for FleetCI agents.
//!
//! - `command`: payload to invocation, including git and dependency steps
//! - `process`: supervised child processes with timeout and cancellation
//! - `engine`: the retry loop and upstream reporting

pub mod command;
pub mod engine;
pub mod error;
pub mod output;
pub mod process;

pub use engine::{EngineConfig, ExecutionEngine, JobOutcome};
pub use error::{ExecutorError, ExecutorResult};
pub use process::{KILL_GRACE, ProcessOutcome};
