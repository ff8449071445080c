//! KDL configuration parsing for FleetCI.
//!
//! This crate handles parsing of:
//! - Coordinator configuration (listen address, storage, agent tokens, shutdown)
//! - Agent configuration (coordinator endpoint, capacity, capabilities)

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod logging;
mod nodes;

pub use agent::{AgentConfig, load_agent_config, parse_agent_config, parse_coordinator_url};
pub use coordinator::{
    CoordinatorConfig, ShutdownConfig, load_coordinator_config, parse_coordinator_config,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::LogFormat;
