//! Decision engine
//!
//! The single ordered pipeline every guarded access goes through:
//! attribution, eval check, trust-root short circuit, spoofing
//! validation, protection gating, then the policy check. The engine is
//! the only place these steps are sequenced, so the precedence rules
//! live here and nowhere else.

use crate::audit::{AuditEvent, AuditLogger};
use crate::caller::{CallerInfo, CallerResolver};
use crate::caller::validate::IdentityValidator;
use crate::context::ContextPropagator;
use crate::identity::Identity;
use crate::policy::{Operation, PolicyStore};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

/// Outcome of a guarded access attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        reason: DenyReason,
        /// Frame-level detail for the denial report, when attribution
        /// produced any.
        caller: Option<CallerInfo>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason, .. } => Some(reason),
        }
    }

    fn deny(reason: DenyReason, caller: Option<CallerInfo>) -> Self {
        Decision::Deny { reason, caller }
    }
}

/// Why an access was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Policy does not grant this identity the operation on this key.
    Unauthorized { identity: Identity },
    /// No strategy produced an attributable caller.
    UnknownCaller,
    /// The access came from a dynamic-evaluation context.
    EvalContext,
    /// The claimed identity failed filesystem validation.
    SpoofedIdentity { claimed: Identity, source: String },
}

/// Runs the full decision pipeline for one access.
pub struct DecisionEngine {
    resolver: Arc<dyn CallerResolver>,
    validator: IdentityValidator,
    propagator: Arc<ContextPropagator>,
    store: PolicyStore,
    audit: Arc<dyn AuditLogger>,
    tampering_detected: bool,
    tamper_logged: Once,
    stats: Mutex<BTreeMap<(Identity, String, Operation), u64>>,
}

impl DecisionEngine {
    pub fn new(
        resolver: Arc<dyn CallerResolver>,
        validator: IdentityValidator,
        propagator: Arc<ContextPropagator>,
        store: PolicyStore,
        tampering_detected: bool,
    ) -> Self {
        let audit = store.audit().clone();
        Self {
            resolver,
            validator,
            propagator,
            store,
            audit,
            tampering_detected,
            tamper_logged: Once::new(),
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn propagator(&self) -> &Arc<ContextPropagator> {
        &self.propagator
    }

    /// Decide one access. `skip` is forwarded to the resolver so callers
    /// deeper in the wrapping layers can discount their own frames.
    pub fn decide(&self, key: &str, operation: Operation, skip: usize) -> Decision {
        if self.tampering_detected {
            // Logged once, denied never: options stay authoritative even
            // when the formatting path was altered before load.
            self.tamper_logged
                .call_once(|| self.audit.log(AuditEvent::TamperingDetected));
        }

        let (info, eval_tainted, needs_validation) = match self.resolver.resolve(skip) {
            Some(resolution) => (
                Some(resolution.info),
                resolution.eval_tainted,
                resolution.needs_validation,
            ),
            None => match self.propagator.current() {
                // An inherited origin is recorded by trusted machinery at
                // unit creation, so it needs no validation.
                Some(identity) => (Some(synthetic_info(identity)), false, false),
                None => (None, false, false),
            },
        };

        let info = match info {
            Some(info) => info,
            None => {
                if self.store.options().fail_closed {
                    self.audit.log(AuditEvent::UnknownCallerDenied {
                        key: key.to_string(),
                        operation,
                    });
                    return Decision::deny(DenyReason::UnknownCaller, None);
                }
                // Fail-open grants are deliberate holes; they are not
                // attributed and not counted.
                return Decision::Allow;
            }
        };

        // Under fail-closed, eval taint outranks everything, the trust
        // root included: code that reached the engine through dynamic
        // evaluation cannot prove it is who the frames say it is. Under
        // fail-open it is one more ambiguous attribution, allowed like
        // an unknown caller and equally uncounted.
        if eval_tainted {
            if !self.store.options().fail_closed {
                return Decision::Allow;
            }
            self.audit.log(AuditEvent::EvalContextDenied {
                key: key.to_string(),
                operation,
            });
            return Decision::deny(DenyReason::EvalContext, Some(info));
        }

        if info.identity.is_main() {
            return Decision::Allow;
        }

        if needs_validation
            && !self.validator.validate(&info.source, &info.identity)
        {
            let claimed = info.identity.clone();
            let source = info.source.display().to_string();
            self.audit.log(AuditEvent::SpoofingDetected {
                claimed: claimed.clone(),
                source: source.clone(),
            });
            return Decision::deny(
                DenyReason::SpoofedIdentity { claimed, source },
                Some(info),
            );
        }

        // Disabled protections bypass the policy for their operation, and
        // bypassed accesses are not counted.
        let options = self.store.options();
        let gated_off = match operation {
            Operation::Write => !options.protect_writes,
            Operation::Delete => !options.protect_deletes,
            Operation::Enumerate => !options.protect_enumeration,
            Operation::Read => false,
        };
        if gated_off {
            return Decision::Allow;
        }

        let allowed = self.store.is_allowed(&info.identity, key, operation);
        self.count(&info.identity, key, operation);
        self.audit.log(AuditEvent::AccessDecision {
            identity: info.identity.clone(),
            key: key.to_string(),
            operation,
            allowed,
        });

        if allowed {
            Decision::Allow
        } else {
            Decision::deny(
                DenyReason::Unauthorized {
                    identity: info.identity.clone(),
                },
                Some(info),
            )
        }
    }

    /// The subset of `all_keys` the current caller may see when
    /// enumerating. The trust root and wildcard holders see everything;
    /// everyone else sees only their readable keys.
    pub fn enumeration_view(&self, all_keys: Vec<String>, skip: usize) -> Vec<String> {
        if !self.store.options().protect_enumeration {
            return all_keys;
        }

        let identity = match self.resolver.resolve(skip) {
            Some(resolution) => {
                if resolution.eval_tainted {
                    if self.store.options().fail_closed {
                        return Vec::new();
                    }
                    return all_keys;
                }
                if resolution.needs_validation
                    && !self
                        .validator
                        .validate(&resolution.info.source, &resolution.info.identity)
                {
                    return Vec::new();
                }
                resolution.info.identity
            }
            None => match self.propagator.current() {
                Some(identity) => identity,
                None => {
                    if self.store.options().fail_closed {
                        return Vec::new();
                    }
                    return all_keys;
                }
            },
        };

        if self.store.has_wildcard_read(&identity) {
            return all_keys;
        }

        all_keys
            .into_iter()
            .filter(|key| self.store.is_allowed(&identity, key, Operation::Enumerate))
            .collect()
    }

    fn count(&self, identity: &Identity, key: &str, operation: Operation) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        *stats
            .entry((identity.clone(), key.to_string(), operation))
            .or_insert(0) += 1;
    }

    /// Access counters flattened to `identity:key:operation` entries.
    pub fn access_stats(&self) -> BTreeMap<String, u64> {
        self.stats
            .lock()
            .expect("stats lock poisoned")
            .iter()
            .map(|((identity, key, operation), count)| {
                (format!("{}:{}:{}", identity, key, operation), *count)
            })
            .collect()
    }

    pub fn clear_caches(&self) {
        self.store.clear_caches();
        self.validator.clear_cache();
        self.stats.lock().expect("stats lock poisoned").clear();
    }
}

/// Caller info for an identity recovered from origin propagation, where
/// no frame-level detail exists.
fn synthetic_info(identity: Identity) -> CallerInfo {
    CallerInfo {
        identity,
        source: std::path::PathBuf::new(),
        line: 0,
        column: 0,
        function_name: String::new(),
        is_eval: false,
        is_constructor: false,
    }
}
