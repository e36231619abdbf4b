//! Runtime error taxonomy

use crate::identity::Identity;
use crate::policy::{Operation, PolicyError};
use envlock_config::ConfigError;
use thiserror::Error;

/// Runtime errors
#[derive(Error, Debug)]
pub enum EnvlockError {
    #[error("Access denied: '{identity}' may not {operation} '{key}'")]
    Unauthorized {
        identity: Identity,
        key: String,
        operation: Operation,
    },

    #[error("Access denied: caller could not be attributed for '{key}'")]
    UnknownCaller { key: String },

    #[error("Access denied: dynamic evaluation context may not touch '{key}'")]
    EvalContext { key: String },

    #[error("Access denied: identity '{claimed}' failed validation (claimed from {claimed_from})")]
    SpoofedIdentity {
        claimed: Identity,
        claimed_from: String,
    },

    #[error("Worker context is not allowed to access '{key}' without an explicit policy snapshot")]
    WorkerNotAllowed { key: String },

    #[error("Protection enabled too late: {loaded} modules already loaded (threshold {threshold})")]
    LoadOrderViolation { loaded: usize, threshold: usize },

    #[error("Invalid session token")]
    InvalidToken,

    #[error("Deprecated: {0}")]
    Deprecated(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type RuntimeResult<T> = Result<T, EnvlockError>;

/// A denied access with enough caller detail to act on the report.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct AccessError {
    #[source]
    pub error: EnvlockError,
    pub identity: Option<Identity>,
    pub key: String,
    pub operation: Operation,
    pub caller_source: Option<String>,
    pub caller_line: Option<u32>,
    pub caller_function: Option<String>,
}

impl AccessError {
    pub fn bare(error: EnvlockError, key: impl Into<String>, operation: Operation) -> Self {
        Self {
            error,
            identity: None,
            key: key.into(),
            operation,
            caller_source: None,
            caller_line: None,
            caller_function: None,
        }
    }
}
