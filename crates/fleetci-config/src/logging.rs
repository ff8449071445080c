//! Log output format shared by both binaries.

use kdl::KdlNode;
use serde::{Deserialize, Serialize};

use crate::nodes::required_string;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Parse a `log-format "text"|"json"` node.
pub(crate) fn parse_log_format(node: &KdlNode) -> ConfigResult<LogFormat> {
    match required_string(node)?.as_str() {
        "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidValue {
            field: "log-format".to_string(),
            message: format!("unknown format '{}'", other),
        }),
    }
}
