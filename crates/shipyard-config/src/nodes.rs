//! Helpers for extracting values from KDL nodes.

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

/// A string argument that must be present.
pub(crate) fn require_string(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: "expected a string".to_string(),
    })
}

/// A non-negative integer argument that fits in `T`.
pub(crate) fn require_uint<T: TryFrom<i128>>(node: &KdlNode) -> ConfigResult<T> {
    let field = node.name().value();
    let value = get_first_int_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected an integer".to_string(),
    })?;
    if value < 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must not be negative, got {}", value),
        });
    }
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("out of range: {}", value),
    })
}

/// A boolean argument; a bare node name counts as `true`.
pub(crate) fn flag(node: &KdlNode) -> bool {
    get_first_bool_arg(node).unwrap_or(true)
}
