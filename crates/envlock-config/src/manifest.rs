//! Module manifests
//!
//! Every installed module carries a `module.toml` at its root declaring its
//! name and dependencies. Envlock reads manifests for two purposes: the
//! identity validator cross-checks a resolved source location against the
//! declared name, and the dependency closure resolver walks declared
//! dependency edges when a policy grants transitive access.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of a module manifest.
pub const MANIFEST_FILE_NAME: &str = "module.toml";

/// Upper bound on the number of parent directories inspected when looking
/// for the manifest that owns a source file.
const MANIFEST_WALK_LIMIT: usize = 32;

/// Module manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Module metadata
    pub module: ModuleMetadata,

    /// Declared dependencies (name -> spec)
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, DependencySpec>,
}

/// Metadata block of a manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleMetadata {
    /// Module name; scoped names use the `@scope/name` form
    pub name: String,

    /// Module version (informational, not validated as semver here)
    #[serde(default)]
    pub version: Option<String>,

    /// Description
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Dependency specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependencySpec {
    /// Shorthand version requirement: `foo = "1.0"`
    Version(String),

    /// Detailed form: `foo = { version = "1.0", path = "../foo" }`
    Detailed {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Manifest {
    /// Load and validate a manifest from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let manifest: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        manifest.validate()?;
        Ok(manifest)
    }

    /// Find the manifest owning `source` by walking parent directories.
    ///
    /// Returns the manifest path, not its contents. The walk is bounded so
    /// a crafted deep path cannot turn validation into an unbounded scan.
    pub fn find_nearest(source: &Path) -> Option<PathBuf> {
        let start = if source.is_dir() {
            source
        } else {
            source.parent()?
        };

        let mut dir = Some(start);
        for _ in 0..MANIFEST_WALK_LIMIT {
            let d = dir?;
            let candidate = d.join(MANIFEST_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            dir = d.parent();
        }
        None
    }

    /// Validate the manifest
    pub fn validate(&self) -> ConfigResult<()> {
        if self.module.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "module.name".to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }

        // A scoped name is exactly `@scope/name`; bare names carry no slash.
        if self.module.name.starts_with('@') {
            let segments: Vec<&str> = self.module.name.splitn(3, '/').collect();
            if segments.len() != 2 || segments[0].len() < 2 || segments[1].is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "module.name".to_string(),
                    reason: format!("invalid scoped name '{}'", self.module.name),
                });
            }
        } else if self.module.name.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "module.name".to_string(),
                reason: "unscoped names cannot contain '/'".to_string(),
            });
        }

        for (name, spec) in &self.dependencies {
            validate_dependency(name, spec)?;
        }

        Ok(())
    }

    /// Declared module name
    pub fn name(&self) -> &str {
        &self.module.name
    }

    /// Names of declared dependencies
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }
}

fn validate_dependency(name: &str, spec: &DependencySpec) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "dependency name".to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }

    match spec {
        DependencySpec::Version(v) => {
            if v.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("dependency '{}'", name),
                    reason: "version cannot be empty".to_string(),
                });
            }
        }
        DependencySpec::Detailed { version, path } => {
            if version.is_none() && path.is_none() {
                return Err(ConfigError::InvalidValue {
                    field: format!("dependency '{}'", name),
                    reason: "must specify version or path".to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_parse_minimal_manifest() {
        let toml = r#"
[module]
name = "left-pad"
version = "1.0.0"
"#;

        let manifest: Manifest = toml::from_str(toml).unwrap();
        assert_eq!(manifest.name(), "left-pad");
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_manifest_with_dependencies() {
        let toml = r#"
[module]
name = "@acme/tool"
version = "2.1.0"

[dependencies]
http = "1.0"
json = { version = "0.5" }
local-lib = { path = "../local-lib" }
"#;

        let manifest: Manifest = toml::from_str(toml).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.dependencies.len(), 3);
        let names: Vec<_> = manifest.dependency_names().collect();
        assert_eq!(names, vec!["http", "json", "local-lib"]);
    }

    #[rstest]
    #[case("")]
    #[case("@scope")]
    #[case("a/b")]
    #[case("@/x")]
    fn test_invalid_module_names(#[case] name: &str) {
        let manifest: Manifest =
            toml::from_str(&format!("[module]\nname = \"{}\"\n", name)).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_invalid_empty_dependency_spec() {
        let toml = r#"
[module]
name = "pkg"

[dependencies]
nothing = {}
"#;
        let manifest: Manifest = toml::from_str(toml).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_find_nearest_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vendor/pkg");
        let nested = root.join("src/util");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            root.join(MANIFEST_FILE_NAME),
            "[module]\nname = \"pkg\"\n",
        )
        .unwrap();
        let source = nested.join("helpers.rs");
        std::fs::write(&source, "").unwrap();

        let found = Manifest::find_nearest(&source).unwrap();
        assert_eq!(found, root.join(MANIFEST_FILE_NAME));
    }

    #[test]
    fn test_find_nearest_bounded() {
        // Nest deeper than the walk limit; a manifest sitting above the
        // window must not be found.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE_NAME),
            "[module]\nname = \"outer\"\n",
        )
        .unwrap();

        let mut deep = dir.path().to_path_buf();
        for i in 0..40 {
            deep.push(format!("d{}", i));
        }
        std::fs::create_dir_all(&deep).unwrap();
        let source = deep.join("leaf.rs");
        std::fs::write(&source, "").unwrap();

        assert_eq!(Manifest::find_nearest(&source), None);
    }
}
