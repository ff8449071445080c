//! Coordinator configuration.

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::logging::{LogFormat, parse_log_format};
use crate::nodes::{all_string_args, required_bool, required_string, required_u64};
use crate::{ConfigError, ConfigResult};

/// How running jobs are treated when the coordinator shuts down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Wait for running jobs to finish before closing channels.
    pub wait_for_jobs: bool,
    /// Cancel running jobs instead of pausing them.
    pub force: bool,
    /// Ceiling on the wait for running jobs.
    pub drain_timeout_secs: u64,
    /// How often to re-check running jobs while waiting.
    pub poll_interval_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            wait_for_jobs: true,
            force: false,
            drain_timeout_secs: 300,
            poll_interval_secs: 5,
        }
    }
}

/// Coordinator-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    /// PostgreSQL URL. In-memory storage is used when absent.
    pub database_url: Option<String>,
    /// Tokens agents may authenticate with.
    pub agent_tokens: Vec<String>,
    /// Hex-encoded 32-byte key for credential encryption.
    pub encryption_key: Option<String>,
    /// Accept credentials stored before encryption was enabled.
    pub allow_plaintext_credentials: bool,
    /// Timezone used for cron schedules when the settings store has none.
    pub default_timezone: String,
    /// Seconds without a heartbeat before an agent is considered gone.
    pub heartbeat_timeout_secs: u64,
    pub shutdown: ShutdownConfig,
    pub log_format: LogFormat,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: None,
            agent_tokens: Vec::new(),
            encryption_key: None,
            allow_plaintext_credentials: false,
            default_timezone: fleetci_core::settings::DEFAULT_TIMEZONE.to_string(),
            heartbeat_timeout_secs: 90,
            shutdown: ShutdownConfig::default(),
            log_format: LogFormat::Text,
        }
    }
}

/// Parse coordinator configuration from KDL text.
pub fn parse_coordinator_config(kdl: &str) -> ConfigResult<CoordinatorConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = CoordinatorConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "listen" => {
                let raw = required_string(node)?;
                config.listen = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "listen".to_string(),
                    message: format!("not a socket address: {}", raw),
                })?;
            }
            "database-url" => config.database_url = Some(required_string(node)?),
            "agent-token" => {
                for token in all_string_args(node) {
                    if config.agent_tokens.contains(&token) {
                        return Err(ConfigError::Duplicate("agent-token".to_string()));
                    }
                    config.agent_tokens.push(token);
                }
            }
            "encryption-key" => {
                let key = required_string(node)?;
                validate_key(&key)?;
                config.encryption_key = Some(key);
            }
            "allow-plaintext-credentials" => {
                config.allow_plaintext_credentials = required_bool(node)?;
            }
            "default-timezone" => config.default_timezone = required_string(node)?,
            "heartbeat-timeout" => config.heartbeat_timeout_secs = required_u64(node)?,
            "log-format" => config.log_format = parse_log_format(node)?,
            "shutdown" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "wait-for-jobs" => config.shutdown.wait_for_jobs = required_bool(child)?,
                            "force" => config.shutdown.force = required_bool(child)?,
                            "drain-timeout" => {
                                config.shutdown.drain_timeout_secs = required_u64(child)?
                            }
                            "poll-interval" => {
                                config.shutdown.poll_interval_secs = required_u64(child)?.max(1)
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a coordinator configuration file.
pub fn load_coordinator_config(path: impl AsRef<Path>) -> ConfigResult<CoordinatorConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_coordinator_config(&content)
}

fn validate_key(key: &str) -> ConfigResult<()> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        field: "encryption-key".to_string(),
        message: message.to_string(),
    };
    let bytes = hex::decode(key).map_err(|_| invalid("must be hex encoded"))?;
    if bytes.len() != 32 {
        return Err(invalid("must decode to 32 bytes"));
    }
    Ok(())
}
