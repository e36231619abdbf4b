//! Module identity
//!
//! An identity names an installed module, or `__main__` for the host
//! application. Identities are derived from source file paths: the
//! innermost `vendor/` segment marks an installed module, and the segment
//! (or two segments, for `@scope/name`) following it is the module name.
//! Extraction is a pure function of the path; the same path always yields
//! the same identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Directory segment under which installed modules live.
pub const VENDOR_SEGMENT: &str = "vendor";

/// Sentinel identity for host application code.
pub const MAIN_IDENTITY: &str = "__main__";

/// The identity attributed to a call: an installed module name or
/// `__main__` for the host application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// The host application identity.
    pub fn main() -> Self {
        Identity(MAIN_IDENTITY.to_string())
    }

    /// Construct an identity from a module name.
    pub fn named(name: impl Into<String>) -> Self {
        Identity(name.into())
    }

    /// Whether this is the host application sentinel.
    pub fn is_main(&self) -> bool {
        self.0 == MAIN_IDENTITY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the identity owning a source path.
    ///
    /// Finds the innermost (last) `vendor/` segment; everything outside a
    /// vendor directory belongs to the host application. Scoped names
    /// (`@scope/name`) consume two path segments.
    pub fn from_path(path: &Path) -> Self {
        let mut segments: Vec<&str> = Vec::new();
        for component in path.components() {
            if let std::path::Component::Normal(os) = component {
                if let Some(s) = os.to_str() {
                    segments.push(s);
                }
            }
        }

        // Innermost occurrence wins: a module vendored inside another
        // module is attributed to the inner one.
        let vendor_idx = segments.iter().rposition(|s| *s == VENDOR_SEGMENT);
        let Some(idx) = vendor_idx else {
            return Identity::main();
        };

        match segments.get(idx + 1) {
            None => Identity::main(),
            Some(first) if first.starts_with('@') => match segments.get(idx + 2) {
                Some(second) => Identity(format!("{}/{}", first, second)),
                None => Identity((*first).to_string()),
            },
            Some(first) => Identity((*first).to_string()),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity(s)
    }
}
