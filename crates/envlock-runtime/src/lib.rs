//! Envlock Runtime - Per-module environment access control
//!
//! This library provides the complete access-control engine including:
//! - Caller attribution from the call stack and origin propagation
//! - Capability policy with read-only peer propagation
//! - Session lifecycle with token-gated disable
//! - Guarded environment views and worker context gating

/// Envlock runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod audit;
pub mod caller;
pub mod closure;
pub mod context;
pub mod engine;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod policy;
pub mod session;
pub mod store;
pub mod workers;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditLogger, MemoryAuditLogger, NullAuditLogger};
pub use caller::{CallerInfo, CallerResolver, ChainResolver, Resolution};
pub use closure::{ClosureResolver, DependencyGraph, InMemoryGraph, ManifestGraph};
pub use context::ContextPropagator;
pub use engine::{Decision, DecisionEngine, DenyReason};
pub use error::{AccessError, EnvlockError, RuntimeResult};
pub use identity::Identity;
pub use policy::{GlobalOptions, Operation, PolicyEntry, PolicySnapshot, PolicyStore};
pub use session::{EnableOptions, Session, SessionHandle, LATE_ENABLE_THRESHOLD};
pub use store::{EnvBackend, GuardedEnv, MemoryEnv, ProcessEnv};
pub use workers::{ContextId, ContextRegistry};
