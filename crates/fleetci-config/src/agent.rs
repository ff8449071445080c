//! Agent configuration.

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::logging::{LogFormat, parse_log_format};
use crate::nodes::{all_string_args, required_string, required_u64};
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint of the coordinator's agent channel.
    pub coordinator: Url,
    pub token: String,
    pub name: String,
    pub max_concurrent_jobs: u32,
    /// Extra capability tags advertised on top of the platform defaults.
    pub capabilities: Vec<String>,
    pub work_dir: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub log_format: LogFormat,
}

/// Parse agent configuration from KDL text.
///
/// `coordinator` and `token` are required; everything else has a default.
pub fn parse_agent_config(kdl: &str) -> ConfigResult<AgentConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut coordinator = None;
    let mut token = None;
    let mut name = None;
    let mut max_concurrent_jobs = 1u32;
    let mut capabilities = Vec::new();
    let mut work_dir = None;
    let mut heartbeat_interval_secs = fleetci_core::protocol::HEARTBEAT_INTERVAL_SECS;
    let mut log_format = LogFormat::Text;

    for node in doc.nodes() {
        match node.name().value() {
            "coordinator" => coordinator = Some(parse_coordinator_url(&required_string(node)?)?),
            "token" => token = Some(required_string(node)?),
            "name" => name = Some(required_string(node)?),
            "max-concurrent-jobs" => {
                let value = required_u64(node)?;
                max_concurrent_jobs = u32::try_from(value)
                    .ok()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "max-concurrent-jobs".to_string(),
                        message: format!("{} is not a positive job count", value),
                    })?;
            }
            "capabilities" => capabilities.extend(all_string_args(node)),
            "work-dir" => work_dir = Some(PathBuf::from(required_string(node)?)),
            "heartbeat-interval" => heartbeat_interval_secs = required_u64(node)?.max(1),
            "log-format" => log_format = parse_log_format(node)?,
            _ => {}
        }
    }

    capabilities.sort();
    capabilities.dedup();

    Ok(AgentConfig {
        coordinator: coordinator
            .ok_or_else(|| ConfigError::MissingField("coordinator".to_string()))?,
        token: token.ok_or_else(|| ConfigError::MissingField("token".to_string()))?,
        name: name.unwrap_or_else(|| "fleetci-agent".to_string()),
        max_concurrent_jobs,
        capabilities,
        work_dir: work_dir.unwrap_or_else(|| std::env::temp_dir().join("fleetci")),
        heartbeat_interval_secs,
        log_format,
    })
}

/// Read and parse an agent configuration file.
pub fn load_agent_config(path: impl AsRef<Path>) -> ConfigResult<AgentConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_agent_config(&content)
}

/// Accepts `ws`/`wss` URLs as given and maps `http`/`https` to them.
pub fn parse_coordinator_url(raw: &str) -> ConfigResult<Url> {
    let invalid = |message: String| ConfigError::InvalidValue {
        field: "coordinator".to_string(),
        message,
    };
    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot change scheme".to_string()))?;
    if url.path() == "/" {
        url.set_path("/agent/ws");
    }
    Ok(url)
}
