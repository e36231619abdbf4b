//! Caller attribution
//!
//! Answers the question "which installed module is making this call?".
//! Two strategies implement [`CallerResolver`]:
//!
//! - [`BacktraceResolver`](backtrace_resolver::BacktraceResolver): captures
//!   a native stack snapshot. Preferred when usable, because native capture
//!   cannot be retargeted by reassigning the stack-formatting hook.
//! - [`FrameStackResolver`](frame_stack::FrameStackResolver): walks a frame
//!   window recorded explicitly by the embedding layer. This portable path
//!   additionally runs eval-context detection, and resolutions produced by
//!   it must pass spoofing validation before they are trusted.
//!
//! Strategies are probed at session start and chained in preference order;
//! when none yields a frame the decision engine falls back to the async
//! context propagator, and after that to "unknown".

pub mod backtrace_resolver;
pub mod frame_stack;
pub mod frames;
pub mod validate;

use crate::identity::Identity;
use envlock_config::Manifest;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fixed table of path fragments owned by the engine or the language
/// runtime itself; frames from these locations never attribute an access.
const INTERNAL_PATH_FRAGMENTS: &[&str] = &[
    "envlock-runtime/src/",
    "envlock-config/src/",
    "vendor/envlock/",
    "/rustc/",
    "library/std/",
    "library/core/",
    "library/alloc/",
];

/// Manifest names that identify the engine's own crates in development
/// (non-installed) layouts, where the path fragments above do not match.
const ENGINE_MODULE_NAMES: &[&str] = &["envlock", "envlock-runtime", "envlock-config"];

/// Information about the frame attributed to an access attempt.
///
/// Produced fresh per attempt and never persisted beyond the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    pub identity: Identity,
    pub source: PathBuf,
    pub line: u32,
    pub column: u32,
    pub function_name: String,
    pub is_eval: bool,
    pub is_constructor: bool,
}

/// Outcome of a successful stack walk.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub info: CallerInfo,
    /// True when any frame in the walked window looked eval-like, even if
    /// the attributed frame itself did not. Dynamic code can be used to
    /// erase or falsify deeper attribution, so the taint covers the whole
    /// window.
    pub eval_tainted: bool,
    /// True when the producing strategy can be spoofed and the resolution
    /// must pass identity validation before being trusted.
    pub needs_validation: bool,
}

/// A caller-resolution strategy.
pub trait CallerResolver: Send + Sync {
    /// Strategy name for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this strategy is usable in the current process.
    fn probe(&self) -> bool;

    /// Walk the current call stack, skipping `skip` candidate frames,
    /// and produce the first attributable frame.
    fn resolve(&self, skip: usize) -> Option<Resolution>;
}

/// Tries strategies in preference order, skipping those whose probe fails.
pub struct ChainResolver {
    strategies: Vec<Arc<dyn CallerResolver>>,
}

impl ChainResolver {
    pub fn new(strategies: Vec<Arc<dyn CallerResolver>>) -> Self {
        Self { strategies }
    }

    /// Native capture first, explicit frame window second.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(backtrace_resolver::BacktraceResolver::new()),
            frame_stack::FrameStackResolver::global().clone(),
        ])
    }
}

impl CallerResolver for ChainResolver {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn probe(&self) -> bool {
        self.strategies.iter().any(|s| s.probe())
    }

    fn resolve(&self, skip: usize) -> Option<Resolution> {
        for strategy in &self.strategies {
            if !strategy.probe() {
                continue;
            }
            if let Some(resolution) = strategy.resolve(skip) {
                return Some(resolution);
            }
        }
        None
    }
}

/// Whether a source path belongs to the runtime's own internals or to the
/// engine, and must be skipped during attribution.
pub fn is_internal_path(path: &Path) -> bool {
    let text = path.to_string_lossy();
    if INTERNAL_PATH_FRAGMENTS
        .iter()
        .any(|fragment| text.contains(fragment))
    {
        return true;
    }

    // Development layout: the engine's sources live outside any vendor
    // directory, so the fragment table misses them. Cross-check the owning
    // manifest instead.
    if Identity::from_path(path).is_main() {
        if let Some(manifest_path) = Manifest::find_nearest(path) {
            if let Ok(manifest) = Manifest::load_from_file(&manifest_path) {
                return ENGINE_MODULE_NAMES.contains(&manifest.name());
            }
        }
    }

    false
}
