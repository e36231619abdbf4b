//! Audit logging
//!
//! Structured, in-memory logging of decision and lifecycle events.
//! Nothing here persists to disk; the logger exists so embeddings and
//! tests can observe every denial, advisory, and tamper signal.

use crate::identity::Identity;
use crate::policy::Operation;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Audit event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// An access decision was made.
    AccessDecision {
        identity: Identity,
        key: String,
        operation: Operation,
        allowed: bool,
    },
    /// An access was denied without an attributable identity.
    UnknownCallerDenied { key: String, operation: Operation },
    /// An access from an eval-like context was denied.
    EvalContextDenied { key: String, operation: Operation },
    /// A resolution failed spoofing validation.
    SpoofingDetected {
        claimed: Identity,
        source: String,
    },
    /// A worker context attempted access without opting in.
    WorkerDenied { key: String, operation: Operation },
    /// A policy grants transitive access with a wide blast radius.
    WidePeerGrant {
        identity: Identity,
        key: String,
        depth: u32,
    },
    /// The stack-formatting hook was already altered at load time.
    TamperingDetected,
    /// A session was enabled.
    SessionEnabled { identities: usize },
    /// A session was disabled with the correct token.
    SessionDisabled,
    /// A token mismatch left the session active.
    InvalidDisableAttempt,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::AccessDecision {
                identity,
                key,
                operation,
                allowed,
            } => {
                let status = if *allowed { "GRANTED" } else { "DENIED" };
                write!(f, "Access {}: {} {} {}", status, identity, operation, key)
            }
            AuditEvent::UnknownCallerDenied { key, operation } => {
                write!(f, "Access denied: unknown caller, {} {}", operation, key)
            }
            AuditEvent::EvalContextDenied { key, operation } => {
                write!(f, "Access denied: eval context, {} {}", operation, key)
            }
            AuditEvent::SpoofingDetected { claimed, source } => {
                write!(f, "Spoofing detected: {} claimed by {}", claimed, source)
            }
            AuditEvent::WorkerDenied { key, operation } => {
                write!(
                    f,
                    "Access denied: worker without session, {} {}",
                    operation, key
                )
            }
            AuditEvent::WidePeerGrant {
                identity,
                key,
                depth,
            } => {
                write!(
                    f,
                    "Advisory: {} propagates '{}' to dependencies at depth {}",
                    identity, key, depth
                )
            }
            AuditEvent::TamperingDetected => {
                write!(f, "Stack-formatting hook was altered before load")
            }
            AuditEvent::SessionEnabled { identities } => {
                write!(f, "Session enabled ({} policy identities)", identities)
            }
            AuditEvent::SessionDisabled => write!(f, "Session disabled"),
            AuditEvent::InvalidDisableAttempt => {
                write!(f, "Disable rejected: token mismatch")
            }
        }
    }
}

/// Audit logger trait for customizable backends
pub trait AuditLogger: Send + Sync {
    /// Log an audit event
    fn log(&self, event: AuditEvent);

    /// Get all logged events (for testing)
    fn events(&self) -> Vec<AuditEvent>;

    /// Clear all logged events (for testing)
    fn clear(&self);
}

/// In-memory audit logger
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        self.events
            .lock()
            .expect("audit log lock poisoned")
            .push(event);
    }

    fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .expect("audit log lock poisoned")
            .clone()
    }

    fn clear(&self) {
        self.events
            .lock()
            .expect("audit log lock poisoned")
            .clear();
    }
}

/// No-op audit logger
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditLogger;

impl NullAuditLogger {
    pub fn new() -> Self {
        Self
    }
}

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}

    fn events(&self) -> Vec<AuditEvent> {
        Vec::new()
    }

    fn clear(&self) {}
}
