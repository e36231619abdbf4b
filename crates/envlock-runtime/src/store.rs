//! Guarded environment access
//!
//! [`GuardedEnv`] is the interposition point: every read, write, delete,
//! and enumeration of the underlying store passes through the decision
//! engine of the active session. With no session active it is a plain
//! pass-through, so embedding it unconditionally costs nothing until
//! protection is enabled.
//!
//! The engine sees only what routes through this wrapper. Covering raw
//! libc `getenv` callers takes an interposition layer below this crate;
//! such a layer should feed its frames through the same decision engine
//! rather than re-implementing policy.

use crate::caller::CallerInfo;
use crate::engine::{Decision, DenyReason};
use crate::error::{AccessError, EnvlockError};
use crate::policy::Operation;
use crate::session::{Session, SessionHandle};
use crate::workers::{ContextId, ContextRegistry};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Storage the guard wraps. Implementations do no access control.
pub trait EnvBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// The real process environment.
pub struct ProcessEnv;

impl EnvBackend for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        // Mutating the process environment is unsynchronized in POSIX;
        // the guard above this backend is the serialization point.
        std::env::set_var(key, value);
    }

    fn remove(&self, key: &str) {
        std::env::remove_var(key);
    }

    fn keys(&self) -> Vec<String> {
        std::env::vars().map(|(k, _)| k).collect()
    }
}

/// An in-memory store for tests and embedded snapshots.
#[derive(Default)]
pub struct MemoryEnv {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(values: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self {
            values: Mutex::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl EnvBackend for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("env store lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .expect("env store lock poisoned")
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values
            .lock()
            .expect("env store lock poisoned")
            .remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .expect("env store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// The wrapper's own frames are filtered by the walker's internal-path
/// check, so no extra skip is needed here. Embedding layers that record
/// frames of their own pass a nonzero skip instead.
const WRAPPER_SKIP: usize = 0;

/// Access-controlled view over an [`EnvBackend`].
pub struct GuardedEnv<B: EnvBackend> {
    backend: B,
    /// Pinned session; `None` means "whatever the process slot holds at
    /// call time", which is how embeddings created before enable work.
    session: Option<Arc<SessionHandle>>,
    /// The worker context this view belongs to, if any. Registered
    /// contexts that have not opted in are refused before the session
    /// lookup, so a worker without its own snapshot cannot fall through
    /// to pass-through access.
    context: Option<(Arc<ContextRegistry>, ContextId)>,
}

impl<B: EnvBackend> GuardedEnv<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            session: None,
            context: None,
        }
    }

    /// Bind to a specific session handle instead of the process slot.
    /// Worker contexts use this with their snapshot-derived handle.
    pub fn with_session(backend: B, session: Arc<SessionHandle>) -> Self {
        Self {
            backend,
            session: Some(session),
            context: None,
        }
    }

    /// Attribute this view to a registered execution context. Accesses
    /// then require the context to be the main one or opted in.
    pub fn in_context(mut self, registry: Arc<ContextRegistry>, id: ContextId) -> Self {
        self.context = Some((registry, id));
        self
    }

    fn session(&self) -> Option<Arc<SessionHandle>> {
        self.session.clone().or_else(Session::active)
    }

    fn check(&self, key: &str, operation: Operation) -> Result<(), AccessError> {
        if let Some((registry, id)) = &self.context {
            if let Err(error) = registry.ensure_allowed(*id, key, operation) {
                return Err(AccessError::bare(error, key, operation));
            }
        }

        let session = match self.session() {
            Some(session) => session,
            None => return Ok(()),
        };

        match session.engine().decide(key, operation, WRAPPER_SKIP) {
            Decision::Allow => Ok(()),
            Decision::Deny { reason, caller } => {
                Err(deny_to_error(reason, caller, key, operation))
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, AccessError> {
        self.check(key, Operation::Read)?;
        Ok(self.backend.get(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), AccessError> {
        self.check(key, Operation::Write)?;
        self.backend.set(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), AccessError> {
        self.check(key, Operation::Delete)?;
        self.backend.remove(key);
        Ok(())
    }

    /// Enumerate keys. Never fails: callers without grants see an empty
    /// or filtered listing rather than an error, mirroring how partial
    /// environments look to ordinary code.
    pub fn keys(&self) -> Vec<String> {
        let all = self.backend.keys();
        if let Some((registry, id)) = &self.context {
            if registry.ensure_allowed(*id, "*", Operation::Enumerate).is_err() {
                return Vec::new();
            }
        }
        match self.session() {
            Some(session) => session.engine().enumeration_view(all, WRAPPER_SKIP),
            None => all,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

fn deny_to_error(
    reason: DenyReason,
    caller: Option<CallerInfo>,
    key: &str,
    operation: Operation,
) -> AccessError {
    let (error, identity) = match reason {
        DenyReason::Unauthorized { identity } => (
            EnvlockError::Unauthorized {
                identity: identity.clone(),
                key: key.to_string(),
                operation,
            },
            Some(identity),
        ),
        DenyReason::UnknownCaller => (
            EnvlockError::UnknownCaller {
                key: key.to_string(),
            },
            None,
        ),
        DenyReason::EvalContext => (
            EnvlockError::EvalContext {
                key: key.to_string(),
            },
            None,
        ),
        DenyReason::SpoofedIdentity { claimed, source } => (
            EnvlockError::SpoofedIdentity {
                claimed: claimed.clone(),
                claimed_from: source,
            },
            Some(claimed),
        ),
    };

    let mut report = AccessError {
        identity,
        ..AccessError::bare(error, key, operation)
    };
    if let Some(info) = caller {
        report.caller_source = Some(info.source.display().to_string());
        report.caller_line = Some(info.line);
        report.caller_function = Some(info.function_name);
    }
    report
}
