//! Helpers for extracting values from KDL nodes.

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

/// First positional integer argument, required to fit in `u64`.
pub(crate) fn first_u64_arg(node: &KdlNode) -> ConfigResult<Option<u64>> {
    let Some(entry) = node.entries().iter().find(|e| e.name().is_none()) else {
        return Ok(None);
    };
    let field = node.name().value();
    let value = entry
        .value()
        .as_integer()
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected an integer".to_string(),
        })?;
    u64::try_from(value)
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("{} is out of range", value),
        })
}

pub(crate) fn required_string(node: &KdlNode) -> ConfigResult<String> {
    first_string_arg(node).ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

pub(crate) fn required_bool(node: &KdlNode) -> ConfigResult<bool> {
    first_bool_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: "expected #true or #false".to_string(),
    })
}

pub(crate) fn required_u64(node: &KdlNode) -> ConfigResult<u64> {
    first_u64_arg(node)?.ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}
