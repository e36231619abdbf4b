//! Worker contexts
//!
//! Policy never crosses an execution-context boundary implicitly. The
//! registry records which context came first (that one is the main
//! context) and which workers have been handed a policy snapshot; a
//! worker that has not opted in is denied outright.

use crate::audit::{AuditEvent, AuditLogger};
use crate::error::{EnvlockError, RuntimeResult};
use crate::policy::Operation;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type ContextId = u64;

/// Tracks execution contexts across the process.
pub struct ContextRegistry {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
    audit: Arc<dyn AuditLogger>,
}

#[derive(Default)]
struct RegistryState {
    main: Option<ContextId>,
    opted_in: HashSet<ContextId>,
}

impl ContextRegistry {
    pub fn new(audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(RegistryState::default()),
            audit,
        }
    }

    /// Register a context. The first registration is the main context;
    /// every later one is a worker.
    pub fn register(&self) -> ContextId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("context registry lock poisoned");
        if state.main.is_none() {
            state.main = Some(id);
        }
        id
    }

    /// Drop a context. A departed main context leaves the slot open for
    /// the next registration.
    pub fn unregister(&self, id: ContextId) {
        let mut state = self.state.lock().expect("context registry lock poisoned");
        state.opted_in.remove(&id);
        if state.main == Some(id) {
            state.main = None;
        }
    }

    pub fn is_main(&self, id: ContextId) -> bool {
        self.state
            .lock()
            .expect("context registry lock poisoned")
            .main
            == Some(id)
    }

    pub fn is_worker(&self, id: ContextId) -> bool {
        !self.is_main(id)
    }

    /// Record that this worker was handed a policy snapshot and may now
    /// run under its own session handle.
    pub fn opt_in(&self, id: ContextId) {
        self.state
            .lock()
            .expect("context registry lock poisoned")
            .opted_in
            .insert(id);
    }

    /// Gate an access originating in `id`. Main always passes; workers
    /// pass only after opting in with a snapshot.
    pub fn ensure_allowed(&self, id: ContextId, key: &str, operation: Operation) -> RuntimeResult<()> {
        let allowed = {
            let state = self.state.lock().expect("context registry lock poisoned");
            state.main == Some(id) || state.opted_in.contains(&id)
        };
        if allowed {
            return Ok(());
        }
        self.audit.log(AuditEvent::WorkerDenied {
            key: key.to_string(),
            operation,
        });
        Err(EnvlockError::WorkerNotAllowed {
            key: key.to_string(),
        })
    }
}
