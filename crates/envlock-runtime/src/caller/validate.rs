//! Identity validation
//!
//! A resolution from the portable strategy claims an identity derived from
//! a path the producer supplied; a symlink placed at the right spot makes
//! a module's files appear to live under another module's directory. The
//! validator resolves all filesystem indirection and cross-checks the
//! canonical location against the claimed identity and its declared
//! manifest name. Every filesystem or parse failure is a validation
//! failure, never a pass-through.

use crate::identity::Identity;
use envlock_config::Manifest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a validation verdict stays cached. Bounds the cost of
/// repeated filesystem checks for hot call sites.
pub const VALIDATION_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    valid: bool,
    expires_at: Instant,
}

pub struct IdentityValidator {
    cache: Mutex<HashMap<(PathBuf, Identity), CachedVerdict>>,
    ttl: Duration,
}

impl IdentityValidator {
    pub fn new() -> Self {
        Self::with_ttl(VALIDATION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Confirm that `source` really belongs to `claimed`.
    pub fn validate(&self, source: &Path, claimed: &Identity) -> bool {
        // The host application is the trust root; there is nothing to
        // cross-check it against.
        if claimed.is_main() {
            return true;
        }

        let key = (source.to_path_buf(), claimed.clone());
        {
            let cache = self.cache.lock().expect("validation cache lock poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.expires_at > Instant::now() {
                    return entry.valid;
                }
            }
        }

        let valid = self.check(source, claimed);

        let mut cache = self.cache.lock().expect("validation cache lock poisoned");
        cache.insert(
            key,
            CachedVerdict {
                valid,
                expires_at: Instant::now() + self.ttl,
            },
        );
        valid
    }

    fn check(&self, source: &Path, claimed: &Identity) -> bool {
        // Resolve symlinks; a missing file fails closed.
        let canonical = match source.canonicalize() {
            Ok(path) => path,
            Err(_) => return false,
        };

        // The canonical location must still derive the claimed identity.
        if &Identity::from_path(&canonical) != claimed {
            return false;
        }

        // And the owning manifest must declare the same name. Scoped
        // names are compared whole.
        let Some(manifest_path) = Manifest::find_nearest(&canonical) else {
            return false;
        };
        match Manifest::load_from_file(&manifest_path) {
            Ok(manifest) => manifest.name() == claimed.as_str(),
            Err(_) => false,
        }
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .expect("validation cache lock poisoned")
            .clear();
    }
}

impl Default for IdentityValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Lay out `<root>/vendor/<dir_name>/` with a manifest declaring
    /// `declared_name` and one source file; returns the source path.
    fn install_module(root: &Path, dir_name: &str, declared_name: &str) -> PathBuf {
        let module_root = root.join("vendor").join(dir_name);
        fs::create_dir_all(module_root.join("src")).unwrap();
        fs::write(
            module_root.join("module.toml"),
            format!("[module]\nname = \"{}\"\n", declared_name),
        )
        .unwrap();
        let source = module_root.join("src").join("lib.rs");
        fs::write(&source, "").unwrap();
        source
    }

    fn fixture_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        // Canonicalize up front so symlinked temp roots (macOS /tmp) do
        // not perturb identity extraction.
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    fn test_main_always_validates() {
        let validator = IdentityValidator::new();
        assert!(validator.validate(Path::new("/nope/nothing.rs"), &Identity::main()));
    }

    #[test]
    fn test_genuine_module_validates() {
        let (_dir, root) = fixture_root();
        let source = install_module(&root, "left-pad", "left-pad");

        let validator = IdentityValidator::new();
        assert!(validator.validate(&source, &Identity::named("left-pad")));
    }

    #[test]
    fn test_manifest_name_mismatch_fails() {
        let (_dir, root) = fixture_root();
        let source = install_module(&root, "friendly", "actually-other");

        let validator = IdentityValidator::new();
        assert!(!validator.validate(&source, &Identity::named("friendly")));
    }

    #[test]
    fn test_missing_file_fails_closed() {
        let (_dir, root) = fixture_root();
        let validator = IdentityValidator::new();
        assert!(!validator.validate(
            &root.join("vendor/ghost/src/lib.rs"),
            &Identity::named("ghost")
        ));
    }

    #[test]
    fn test_missing_manifest_fails_closed() {
        let (_dir, root) = fixture_root();
        let module_root = root.join("vendor").join("bare");
        fs::create_dir_all(&module_root).unwrap();
        let source = module_root.join("lib.rs");
        fs::write(&source, "").unwrap();

        let validator = IdentityValidator::new();
        assert!(!validator.validate(&source, &Identity::named("bare")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_spoof_detected() {
        let (_dir, root) = fixture_root();
        install_module(&root, "evil", "evil");

        // `vendor/trusted` is a symlink into evil's directory, so paths
        // under it claim identity `trusted` while resolving to `evil`.
        std::os::unix::fs::symlink(root.join("vendor/evil"), root.join("vendor/trusted"))
            .unwrap();
        let spoofed = root.join("vendor/trusted/src/lib.rs");
        assert_eq!(Identity::from_path(&spoofed).as_str(), "trusted");

        let validator = IdentityValidator::new();
        assert!(!validator.validate(&spoofed, &Identity::named("trusted")));
        // The real identity through the same file still validates.
        assert!(validator.validate(
            &root.join("vendor/evil/src/lib.rs"),
            &Identity::named("evil")
        ));
    }

    #[test]
    fn test_verdict_is_cached_within_ttl() {
        let (_dir, root) = fixture_root();
        let source = install_module(&root, "cached", "cached");

        let validator = IdentityValidator::new();
        assert!(validator.validate(&source, &Identity::named("cached")));

        // Removing the manifest does not flip the cached verdict...
        fs::remove_file(root.join("vendor/cached/module.toml")).unwrap();
        assert!(validator.validate(&source, &Identity::named("cached")));

        // ...but an explicit cache clear forces revalidation.
        validator.clear_cache();
        assert!(!validator.validate(&source, &Identity::named("cached")));
    }

    #[test]
    fn test_expired_entries_revalidate() {
        let (_dir, root) = fixture_root();
        let source = install_module(&root, "stale", "stale");

        let validator = IdentityValidator::with_ttl(Duration::from_millis(0));
        assert!(validator.validate(&source, &Identity::named("stale")));
        fs::remove_file(root.join("vendor/stale/module.toml")).unwrap();
        assert!(!validator.validate(&source, &Identity::named("stale")));
    }
}
