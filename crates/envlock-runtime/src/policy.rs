//! Capability policy
//!
//! The normalized, cached representation of the per-module allow-lists
//! plus the global options, and the `is_allowed` check combining direct
//! grants, wildcards, and read-only peer propagation through the
//! dependency closure. Absence of an identity in the store means zero
//! grants: the system is default-deny, and only `__main__` is exempt.

use crate::audit::{AuditEvent, AuditLogger};
use crate::closure::ClosureResolver;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Reserved policy-source key carrying global options.
pub const OPTIONS_KEY: &str = "__options__";

/// Wildcard grant covering every key.
pub const WILDCARD: &str = "*";

/// Variables whose transitive exposure is considered low-sensitivity;
/// wide peer grants covering anything else trip the advisory.
const LOW_SENSITIVITY_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "TZ", "PWD", "TMPDIR", "HOSTNAME",
];

/// Policy errors
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy source is not valid JSON: {0}")]
    InvalidDocument(String),

    #[error("Policy source must be a JSON object")]
    NotAnObject,

    #[error("Invalid policy entry for '{identity}': {reason}")]
    InvalidEntry { identity: String, reason: String },

    #[error("Invalid global options: {0}")]
    InvalidOptions(String),
}

/// Guarded operations on the shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Delete,
    Enumerate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::Enumerate => "enumerate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global options, one singleton per active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalOptions {
    /// Deny when attribution is inconclusive (unknown caller, eval
    /// context, cross-isolate). Fail-safe rather than fail-available.
    pub fail_closed: bool,
    pub protect_writes: bool,
    pub protect_deletes: bool,
    pub protect_enumeration: bool,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            fail_closed: true,
            protect_writes: true,
            protect_deletes: true,
            protect_enumeration: true,
        }
    }
}

/// Per-identity allow-lists and propagation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyEntry {
    /// Keys readable by this identity; may contain `"*"`.
    pub allowed: HashSet<String>,
    pub can_write: HashSet<String>,
    pub can_delete: HashSet<String>,
    /// Extend read grants to declared dependencies.
    pub allow_peer_dependencies: bool,
    /// Dependency hops covered by peer propagation.
    pub peer_depth_limit: u32,
    /// Dependencies that never inherit, regardless of depth.
    pub exclude_peer_dependencies: HashSet<Identity>,
}

impl Default for PolicyEntry {
    fn default() -> Self {
        Self {
            allowed: HashSet::new(),
            can_write: HashSet::new(),
            can_delete: HashSet::new(),
            allow_peer_dependencies: false,
            // One hop: when propagation is turned on without an explicit
            // limit, only direct dependencies inherit.
            peer_depth_limit: 1,
            exclude_peer_dependencies: HashSet::new(),
        }
    }
}

impl PolicyEntry {
    /// Entry granting read access to the given keys and nothing else.
    pub fn read_only(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn allows_read(&self, key: &str) -> bool {
        self.allowed.contains(WILDCARD) || self.allowed.contains(key)
    }

    fn allows_write(&self, key: &str) -> bool {
        self.can_write.contains(WILDCARD) || self.can_write.contains(key)
    }

    fn allows_delete(&self, key: &str) -> bool {
        self.can_delete.contains(WILDCARD) || self.can_delete.contains(key)
    }
}

/// Serializable `{policy, options}` snapshot for propagation into other
/// execution contexts (workers), bypassing manifest discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    pub policy: BTreeMap<String, PolicyEntry>,
    pub options: GlobalOptions,
}

impl PolicySnapshot {
    /// Parse the policy source contract from a JSON document.
    ///
    /// Entry values may be a literal string (single allowed read key), a
    /// list of read keys, or a full entry record. The reserved
    /// `__options__` key carries [`GlobalOptions`] and never names an
    /// identity. Anything malformed is a hard error; there is no
    /// insecure-default fallback.
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self, PolicyError> {
        let object = value.as_object().ok_or(PolicyError::NotAnObject)?;

        let mut policy = BTreeMap::new();
        let mut options = GlobalOptions::default();

        for (name, entry_value) in object {
            if name == OPTIONS_KEY {
                options = serde_json::from_value(entry_value.clone())
                    .map_err(|e| PolicyError::InvalidOptions(e.to_string()))?;
                continue;
            }

            let entry = match entry_value {
                serde_json::Value::String(key) => PolicyEntry::read_only([key.clone()]),
                serde_json::Value::Array(keys) => {
                    let mut allowed = HashSet::new();
                    for key in keys {
                        let key = key.as_str().ok_or_else(|| PolicyError::InvalidEntry {
                            identity: name.clone(),
                            reason: "allowed keys must be strings".to_string(),
                        })?;
                        allowed.insert(key.to_string());
                    }
                    PolicyEntry::read_only(allowed)
                }
                serde_json::Value::Object(_) => serde_json::from_value(entry_value.clone())
                    .map_err(|e| PolicyError::InvalidEntry {
                        identity: name.clone(),
                        reason: e.to_string(),
                    })?,
                other => {
                    return Err(PolicyError::InvalidEntry {
                        identity: name.clone(),
                        reason: format!("unsupported entry shape: {}", other),
                    })
                }
            };

            policy.insert(name.clone(), entry);
        }

        Ok(Self { policy, options })
    }

    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| PolicyError::InvalidDocument(e.to_string()))?;
        Self::from_json_value(&value)
    }

    /// Load the policy contract from a JSON document on disk.
    pub fn load(path: &Path) -> Result<Self, crate::error::EnvlockError> {
        let value = envlock_config::load_policy_document(path)?;
        Ok(Self::from_json_value(&value)?)
    }
}

/// The normalized policy plus its session-scoped caches.
pub struct PolicyStore {
    entries: BTreeMap<Identity, PolicyEntry>,
    options: GlobalOptions,
    closure: ClosureResolver,
    /// Per-key memo of the identity set allowed to read via peer
    /// propagation. Recomputed per distinct key, not per access.
    key_grants: Mutex<HashMap<String, HashSet<Identity>>>,
    audit: Arc<dyn AuditLogger>,
}

impl PolicyStore {
    pub fn new(
        snapshot: PolicySnapshot,
        closure: ClosureResolver,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let entries: BTreeMap<Identity, PolicyEntry> = snapshot
            .policy
            .into_iter()
            .map(|(name, entry)| (Identity::named(name), entry))
            .collect();

        // One-time advisory for wide transitive grants over keys that do
        // not look like low-sensitivity system variables.
        for (identity, entry) in &entries {
            if !entry.allow_peer_dependencies || entry.peer_depth_limit <= 1 {
                continue;
            }
            if let Some(key) = entry
                .allowed
                .iter()
                .find(|key| !is_low_sensitivity(key.as_str()))
            {
                audit.log(AuditEvent::WidePeerGrant {
                    identity: identity.clone(),
                    key: key.clone(),
                    depth: entry.peer_depth_limit,
                });
            }
        }

        Self {
            entries,
            options: snapshot.options,
            closure,
            key_grants: Mutex::new(HashMap::new()),
            audit,
        }
    }

    pub fn options(&self) -> GlobalOptions {
        self.options
    }

    pub fn identity_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether `identity` may perform `operation` on `key`.
    pub fn is_allowed(&self, identity: &Identity, key: &str, operation: Operation) -> bool {
        // The host application is the trust root.
        if identity.is_main() {
            return true;
        }

        if let Some(entry) = self.entries.get(identity) {
            let direct = match operation {
                Operation::Read | Operation::Enumerate => entry.allows_read(key),
                Operation::Write => entry.allows_write(key),
                Operation::Delete => entry.allows_delete(key),
            };
            if direct {
                return true;
            }
        }

        // Peer propagation extends read grants only.
        if !matches!(operation, Operation::Read | Operation::Enumerate) {
            return false;
        }

        self.peer_granted_identities(key).contains(identity)
    }

    /// Whether `identity` holds a wildcard read grant.
    pub fn has_wildcard_read(&self, identity: &Identity) -> bool {
        identity.is_main()
            || self
                .entries
                .get(identity)
                .is_some_and(|entry| entry.allowed.contains(WILDCARD))
    }

    /// Identities allowed to read `key` through some propagating parent.
    fn peer_granted_identities(&self, key: &str) -> HashSet<Identity> {
        if let Some(cached) = self
            .key_grants
            .lock()
            .expect("key grant memo lock poisoned")
            .get(key)
        {
            return cached.clone();
        }

        let mut granted = HashSet::new();
        for (parent, entry) in &self.entries {
            if !entry.allow_peer_dependencies || !entry.allows_read(key) {
                continue;
            }
            granted.extend(self.closure.closure_of(
                parent,
                entry.peer_depth_limit,
                &entry.exclude_peer_dependencies,
            ));
        }

        self.key_grants
            .lock()
            .expect("key grant memo lock poisoned")
            .insert(key.to_string(), granted.clone());
        granted
    }

    /// Drop all session caches (key memo and dependency closures).
    pub fn clear_caches(&self) {
        self.key_grants
            .lock()
            .expect("key grant memo lock poisoned")
            .clear();
        self.closure.clear_cache();
    }

    pub fn audit(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    /// Rebuild the serializable `{policy, options}` snapshot.
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            policy: self
                .entries
                .iter()
                .map(|(identity, entry)| (identity.as_str().to_string(), entry.clone()))
                .collect(),
            options: self.options,
        }
    }
}

fn is_low_sensitivity(key: &str) -> bool {
    LOW_SENSITIVITY_VARS.contains(&key) || key.starts_with("LC_") || key.ends_with("_ENV")
}
