//! FleetCI build agent.
//!
//! - `agent`: the coordinator session, heartbeat and reconnect loop
//! - `backoff`: reconnect delays

pub mod agent;
pub mod backoff;
pub mod error;

pub use agent::{Agent, SessionEnd, agent_info};
pub use backoff::Backoff;
pub use error::{AgentError, AgentResult};
