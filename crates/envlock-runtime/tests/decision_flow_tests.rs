//! End-to-end decision flow through a guarded store.
//!
//! These tests bind a session handle directly to the guard, so they run
//! independently of the process-wide slot and of each other.

use envlock_runtime::{
    AccessError, AuditEvent, AuditLogger, CallerInfo, CallerResolver, EnvlockError, GuardedEnv,
    Identity,
    MemoryAuditLogger, MemoryEnv, Operation, PolicySnapshot, Resolution, Session, SessionHandle,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A trusted resolver whose reported identity can be switched per call
/// site, standing in for real stack capture.
struct ScriptedResolver {
    current: Mutex<Option<Identity>>,
}

impl ScriptedResolver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
        })
    }

    fn act_as(&self, name: &str) {
        let identity = if name == "__main__" {
            Identity::main()
        } else {
            Identity::named(name)
        };
        *self.current.lock().unwrap() = Some(identity);
    }

    fn vanish(&self) {
        *self.current.lock().unwrap() = None;
    }
}

impl CallerResolver for ScriptedResolver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn probe(&self) -> bool {
        true
    }

    fn resolve(&self, _skip: usize) -> Option<Resolution> {
        let identity = self.current.lock().unwrap().clone()?;
        Some(Resolution {
            info: CallerInfo {
                source: PathBuf::from(format!("vendor/{}/src/lib.rs", identity)),
                identity,
                line: 1,
                column: 1,
                function_name: "read_config".to_string(),
                is_eval: false,
                is_constructor: false,
            },
            eval_tainted: false,
            needs_validation: false,
        })
    }
}

fn guarded(
    policy: &str,
) -> (
    GuardedEnv<MemoryEnv>,
    Arc<ScriptedResolver>,
    Arc<SessionHandle>,
    Arc<MemoryAuditLogger>,
) {
    let resolver = ScriptedResolver::new();
    let audit = Arc::new(MemoryAuditLogger::new());
    let handle = Session::enable_in_worker(
        PolicySnapshot::from_json_str(policy).unwrap(),
        resolver.clone(),
        audit.clone(),
    );
    let env = GuardedEnv::with_session(
        MemoryEnv::with([("API_KEY", "secret"), ("LOG_LEVEL", "debug"), ("HOME", "/root")]),
        handle.clone(),
    );
    (env, resolver, handle, audit)
}

#[test]
fn test_granted_module_reads_its_key() {
    let (env, resolver, handle, _) = guarded(r#"{"http-client": ["API_KEY"]}"#);
    resolver.act_as("http-client");

    assert_eq!(env.get("API_KEY").unwrap().as_deref(), Some("secret"));
    assert_eq!(
        handle.access_stats().get("http-client:API_KEY:read"),
        Some(&1)
    );
}

#[test]
fn test_ungranted_key_is_denied_but_counted() {
    let (env, resolver, handle, audit) = guarded(r#"{"http-client": ["API_KEY"]}"#);
    resolver.act_as("http-client");

    let err = env.get("HOME").unwrap_err();
    assert!(matches!(err.error, EnvlockError::Unauthorized { .. }));
    assert_eq!(err.identity, Some(Identity::named("http-client")));
    assert_eq!(handle.access_stats().get("http-client:HOME:read"), Some(&1));
    assert!(audit.events().iter().any(|e| matches!(
        e,
        AuditEvent::AccessDecision { allowed: false, .. }
    )));
}

#[test]
fn test_module_absent_from_policy_is_denied() {
    let (env, resolver, _, _) = guarded(r#"{"http-client": ["API_KEY"]}"#);
    resolver.act_as("left-pad");

    assert!(env.get("API_KEY").is_err());
}

#[test]
fn test_main_reads_writes_and_deletes_freely() {
    let (env, resolver, handle, _) = guarded(r#"{}"#);
    resolver.act_as("__main__");

    assert!(env.get("API_KEY").is_ok());
    assert!(env.set("NEW_VAR", "1").is_ok());
    assert!(env.remove("LOG_LEVEL").is_ok());
    // Trust-root accesses are not counted.
    assert!(handle.access_stats().is_empty());
}

#[test]
fn test_write_requires_its_own_grant() {
    let (env, resolver, _, _) =
        guarded(r#"{"configurator": {"allowed": ["LOG_LEVEL"], "canWrite": ["LOG_LEVEL"]}}"#);
    resolver.act_as("configurator");

    assert!(env.set("LOG_LEVEL", "trace").is_ok());
    assert_eq!(env.get("LOG_LEVEL").unwrap().as_deref(), Some("trace"));
    // A read grant alone does not permit deletion.
    let err = env.remove("LOG_LEVEL").unwrap_err();
    assert_eq!(err.operation, Operation::Delete);
}

#[test]
fn test_unknown_caller_fails_closed_by_default() {
    let (env, resolver, handle, audit) = guarded(r#"{"http-client": ["API_KEY"]}"#);
    resolver.vanish();

    let err = env.get("API_KEY").unwrap_err();
    assert!(matches!(err.error, EnvlockError::UnknownCaller { .. }));
    assert!(handle.access_stats().is_empty());
    assert!(audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::UnknownCallerDenied { .. })));
}

#[test]
fn test_unknown_caller_fail_open_when_configured() {
    let (env, resolver, handle, _) = guarded(
        r#"{"http-client": ["API_KEY"], "__options__": {"failClosed": false}}"#,
    );
    resolver.vanish();

    assert_eq!(env.get("API_KEY").unwrap().as_deref(), Some("secret"));
    // Fail-open grants carry no attribution and are not counted.
    assert!(handle.access_stats().is_empty());
}

#[test]
fn test_disabled_write_protection_lets_writes_through() {
    let (env, resolver, _, _) = guarded(
        r#"{"http-client": ["API_KEY"], "__options__": {"protectWrites": false}}"#,
    );
    resolver.act_as("http-client");

    assert!(env.set("ANYTHING", "1").is_ok());
    // Reads keep going through policy.
    assert!(env.get("HOME").is_err());
}

#[test]
fn test_enumeration_shows_only_readable_keys() {
    let (env, resolver, _, _) = guarded(r#"{"logger": ["LOG_LEVEL", "HOME"]}"#);
    resolver.act_as("logger");

    let mut keys = env.keys();
    keys.sort();
    assert_eq!(keys, vec!["HOME".to_string(), "LOG_LEVEL".to_string()]);
}

#[test]
fn test_enumeration_full_for_main_and_wildcard() {
    let (env, resolver, _, _) = guarded(r#"{"omni": ["*"]}"#);

    resolver.act_as("__main__");
    assert_eq!(env.keys().len(), 3);

    resolver.act_as("omni");
    assert_eq!(env.keys().len(), 3);
}

#[test]
fn test_enumeration_empty_for_unknown_caller() {
    let (env, resolver, _, _) = guarded(r#"{"logger": ["LOG_LEVEL"]}"#);
    resolver.vanish();

    assert!(env.keys().is_empty());
}

#[test]
fn test_stats_accumulate_across_operations() {
    let (env, resolver, handle, _) = guarded(
        r#"{"app-lib": {"allowed": ["LOG_LEVEL"], "canWrite": ["LOG_LEVEL"]}}"#,
    );
    resolver.act_as("app-lib");

    let _ = env.get("LOG_LEVEL");
    let _ = env.get("LOG_LEVEL");
    let _ = env.set("LOG_LEVEL", "warn");

    let stats = handle.access_stats();
    assert_eq!(stats.get("app-lib:LOG_LEVEL:read"), Some(&2));
    assert_eq!(stats.get("app-lib:LOG_LEVEL:write"), Some(&1));
}

fn access_error_display(err: &AccessError) -> String {
    err.to_string()
}

#[test]
fn test_denial_message_names_identity_key_and_operation() {
    let (env, resolver, _, _) = guarded(r#"{"http-client": ["API_KEY"]}"#);
    resolver.act_as("http-client");

    let err = env.get("HOME").unwrap_err();
    let message = access_error_display(&err);
    assert!(message.contains("http-client"));
    assert!(message.contains("HOME"));
    assert!(message.contains("read"));
}
