//! Dependency closure resolution
//!
//! When a policy entry opts into peer propagation, the identities that
//! inherit its read grants are its declared dependencies, walked
//! breadth-first up to the entry's depth limit, minus the excluded names.
//! The walk is cycle-safe (visited set) and memoized per parent until the
//! session caches are cleared.

use crate::identity::Identity;
use envlock_config::Manifest;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

/// Source of declared-dependency edges.
pub trait DependencyGraph: Send + Sync {
    /// Direct declared dependencies of `identity`, or empty when unknown.
    fn dependencies_of(&self, identity: &Identity) -> Vec<Identity>;
}

/// Edges read from installed module manifests under vendor roots.
pub struct ManifestGraph {
    vendor_roots: Vec<PathBuf>,
}

impl ManifestGraph {
    /// `roots` are application roots; each is expected to contain a
    /// `vendor/` directory of installed modules.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            vendor_roots: roots,
        }
    }
}

impl DependencyGraph for ManifestGraph {
    fn dependencies_of(&self, identity: &Identity) -> Vec<Identity> {
        if identity.is_main() {
            return Vec::new();
        }
        for root in &self.vendor_roots {
            let manifest_path = root
                .join(crate::identity::VENDOR_SEGMENT)
                .join(identity.as_str())
                .join(envlock_config::MANIFEST_FILE_NAME);
            if let Ok(manifest) = Manifest::load_from_file(&manifest_path) {
                return manifest
                    .dependency_names()
                    .map(Identity::named)
                    .collect();
            }
        }
        Vec::new()
    }
}

/// In-memory edges, used by tests and worker sessions that receive a
/// serialized graph instead of filesystem access.
#[derive(Debug, Default, Clone)]
pub struct InMemoryGraph {
    edges: BTreeMap<Identity, Vec<Identity>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, module: impl Into<Identity>, deps: Vec<&str>) {
        self.edges
            .insert(module.into(), deps.into_iter().map(Identity::named).collect());
    }
}

impl DependencyGraph for InMemoryGraph {
    fn dependencies_of(&self, identity: &Identity) -> Vec<Identity> {
        self.edges.get(identity).cloned().unwrap_or_default()
    }
}

/// Memoizing closure resolver over a dependency graph.
pub struct ClosureResolver {
    graph: Box<dyn DependencyGraph>,
    memo: Mutex<HashMap<Identity, HashSet<Identity>>>,
}

impl ClosureResolver {
    pub fn new(graph: Box<dyn DependencyGraph>) -> Self {
        Self {
            graph,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Depth-limited, exclusion-filtered dependency closure of `parent`.
    ///
    /// The parent itself is not a member. Excluded names are neither
    /// members nor traversed through.
    pub fn closure_of(
        &self,
        parent: &Identity,
        depth_limit: u32,
        exclude: &HashSet<Identity>,
    ) -> HashSet<Identity> {
        // Memoized per parent; depth and exclusions come from the
        // parent's own policy entry, so they cannot differ between calls
        // within one session.
        if let Some(cached) = self
            .memo
            .lock()
            .expect("closure memo lock poisoned")
            .get(parent)
        {
            return cached.clone();
        }

        let mut closure = HashSet::new();
        let mut visited: HashSet<Identity> = HashSet::new();
        visited.insert(parent.clone());
        let mut queue: VecDeque<(Identity, u32)> = VecDeque::new();
        queue.push_back((parent.clone(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= depth_limit {
                continue;
            }
            for dep in self.graph.dependencies_of(&current) {
                if exclude.contains(&dep) || !visited.insert(dep.clone()) {
                    continue;
                }
                closure.insert(dep.clone());
                queue.push_back((dep, depth + 1));
            }
        }

        self.memo
            .lock()
            .expect("closure memo lock poisoned")
            .insert(parent.clone(), closure.clone());
        closure
    }

    pub fn clear_cache(&self) {
        self.memo
            .lock()
            .expect("closure memo lock poisoned")
            .clear();
    }
}
