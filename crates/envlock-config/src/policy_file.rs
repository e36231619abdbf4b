//! Policy document loading
//!
//! A policy document is a JSON object mapping module names to policy
//! entries, with the reserved `__options__` key carrying global options.
//! The document is parsed into a raw `serde_json::Value` here; the
//! runtime's policy module interprets the entry shapes. A malformed
//! document is a hard error at enable time, never a silent default.

use crate::{ConfigError, ConfigResult};
use std::path::Path;

/// Load a policy document from a JSON file.
///
/// The root must be a JSON object; anything else fails validation.
pub fn load_policy_document(path: &Path) -> ConfigResult<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

    if !value.is_object() {
        return Err(ConfigError::ValidationError(format!(
            "policy document {} must be a JSON object at the top level",
            path.display()
        )));
    }

    Ok(value)
}
