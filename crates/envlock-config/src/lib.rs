//! Envlock Configuration
//!
//! Provides the on-disk configuration surface for envlock:
//! - Module manifests (`module.toml`): declared name and dependencies of an
//!   installed module, consulted for spoofing validation and transitive
//!   grant resolution
//! - Policy documents: the JSON policy source handed to a session at
//!   enable time
//!
//! Configuration errors are always fatal to the operation that triggered
//! them; envlock never falls back to a default policy when a supplied
//! source fails to parse.

pub mod manifest;
pub mod policy_file;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid JSON syntax in {file}: {error}")]
    JsonParseError {
        file: PathBuf,
        error: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use manifest::{DependencySpec, Manifest, ModuleMetadata, MANIFEST_FILE_NAME};
pub use policy_file::load_policy_document;
