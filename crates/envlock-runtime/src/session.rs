//! Session lifecycle
//!
//! One protection session per process. Enabling installs the decision
//! engine behind a process-wide slot and mints an unguessable disable
//! token; disabling requires that token back. Worker contexts never
//! touch the process slot and get their own handle from a serialized
//! policy snapshot.

use crate::audit::{AuditEvent, AuditLogger, NullAuditLogger};
use crate::caller::validate::IdentityValidator;
use crate::caller::{CallerResolver, ChainResolver};
use crate::closure::{ClosureResolver, DependencyGraph, ManifestGraph};
use crate::context::ContextPropagator;
use crate::engine::DecisionEngine;
use crate::error::{EnvlockError, RuntimeResult};
use crate::integrity::IntegrityMonitor;
use crate::policy::{PolicySnapshot, PolicyStore};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Modules loaded before enabling beyond which protection is refused.
/// Code loaded before the session existed accessed everything freely,
/// so a late enable gives little more than false confidence.
pub const LATE_ENABLE_THRESHOLD: usize = 64;

const TOKEN_BYTES: usize = 32;

static ACTIVE: OnceLock<Mutex<Option<Arc<SessionHandle>>>> = OnceLock::new();

fn active_slot() -> &'static Mutex<Option<Arc<SessionHandle>>> {
    ACTIVE.get_or_init(|| Mutex::new(None))
}

/// Everything `Session::enable` needs beyond the policy itself.
pub struct EnableOptions {
    pub policy: PolicySnapshot,
    /// Roots scanned for vendored module manifests when no explicit
    /// dependency graph is supplied.
    pub vendor_roots: Vec<PathBuf>,
    pub graph: Option<Box<dyn DependencyGraph>>,
    pub resolver: Option<Arc<dyn CallerResolver>>,
    pub audit: Option<Arc<dyn AuditLogger>>,
    /// How many modules the host had loaded before calling enable.
    pub loaded_modules: usize,
    pub allow_late_enable: bool,
}

impl EnableOptions {
    pub fn new(policy: PolicySnapshot) -> Self {
        Self {
            policy,
            vendor_roots: Vec::new(),
            graph: None,
            resolver: None,
            audit: None,
            loaded_modules: 0,
            allow_late_enable: false,
        }
    }
}

/// Entry points for the process-wide session.
pub struct Session;

impl Session {
    /// Enable protection. Idempotent: a second call while a session is
    /// active returns the existing handle without minting a new token.
    pub fn enable(options: EnableOptions) -> RuntimeResult<Arc<SessionHandle>> {
        let mut slot = active_slot().lock().expect("session slot lock poisoned");
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        if options.loaded_modules > LATE_ENABLE_THRESHOLD && !options.allow_late_enable {
            return Err(EnvlockError::LoadOrderViolation {
                loaded: options.loaded_modules,
                threshold: LATE_ENABLE_THRESHOLD,
            });
        }

        let handle = Arc::new(SessionHandle::build(
            options.policy,
            options
                .graph
                .unwrap_or_else(|| Box::new(ManifestGraph::new(options.vendor_roots))),
            options
                .resolver
                .unwrap_or_else(|| Arc::new(ChainResolver::standard())),
            options
                .audit
                .unwrap_or_else(|| Arc::new(NullAuditLogger::new())),
        ));
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The currently active process session, if any.
    pub fn active() -> Option<Arc<SessionHandle>> {
        active_slot()
            .lock()
            .expect("session slot lock poisoned")
            .clone()
    }

    /// Enable protection inside a worker context from a snapshot handed
    /// over by the main context. The handle is scoped to the caller and
    /// never installed in the process slot.
    pub fn enable_in_worker(
        snapshot: PolicySnapshot,
        resolver: Arc<dyn CallerResolver>,
        audit: Arc<dyn AuditLogger>,
    ) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::build(
            snapshot,
            Box::new(ManifestGraph::new(Vec::new())),
            resolver,
            audit,
        ))
    }
}

/// A live protection session.
pub struct SessionHandle {
    engine: Arc<DecisionEngine>,
    token: String,
    audit: Arc<dyn AuditLogger>,
}

impl SessionHandle {
    fn build(
        policy: PolicySnapshot,
        graph: Box<dyn DependencyGraph>,
        resolver: Arc<dyn CallerResolver>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let monitor = IntegrityMonitor::install();
        let tampering = monitor.was_tampering_detected() || monitor.freeze_failed();

        let identities = policy.policy.len();
        let store = PolicyStore::new(policy, ClosureResolver::new(graph), audit.clone());
        let engine = DecisionEngine::new(
            resolver,
            IdentityValidator::new(),
            Arc::new(ContextPropagator::new()),
            store,
            tampering,
        );

        audit.log(AuditEvent::SessionEnabled { identities });

        Self {
            engine: Arc::new(engine),
            token: mint_token(),
            audit,
        }
    }

    /// The disable token, returned exactly here and nowhere else. The
    /// caller decides how carefully to hold it.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn access_stats(&self) -> BTreeMap<String, u64> {
        self.engine.access_stats()
    }

    /// A serializable copy of the active policy and options, for handing
    /// to worker contexts.
    pub fn snapshot(&self) -> PolicySnapshot {
        self.engine.store().snapshot()
    }

    /// Disable the session. A wrong token leaves the session fully
    /// active; a right one drops every cache and counter with it.
    pub fn disable(&self, candidate: &str) -> RuntimeResult<()> {
        if !constant_time_eq(candidate.as_bytes(), self.token.as_bytes()) {
            self.audit.log(AuditEvent::InvalidDisableAttempt);
            return Err(EnvlockError::InvalidToken);
        }

        self.engine.clear_caches();
        self.engine.propagator().disable();
        self.audit.log(AuditEvent::SessionDisabled);

        let mut slot = active_slot().lock().expect("session slot lock poisoned");
        if slot
            .as_ref()
            .is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), self))
        {
            *slot = None;
        }
        Ok(())
    }

    /// The pre-token disable path. Always fails; the token returned by
    /// enable is the only way to turn protection off.
    pub fn disable_unchecked(&self) -> RuntimeResult<()> {
        self.audit.log(AuditEvent::InvalidDisableAttempt);
        Err(EnvlockError::Deprecated(
            "token-less disable is no longer supported; pass the token from enable".to_string(),
        ))
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Length-then-content comparison that does not short-circuit on the
/// first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
