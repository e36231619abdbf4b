//! Portable fallback strategy
//!
//! When native capture is unusable, the embedding layer records the frame
//! window explicitly at each interception point and this resolver walks
//! it. Because the window is producer-supplied it can be forged, so
//! resolutions carry `needs_validation` and the walk runs eval-context
//! detection.

use crate::caller::frames::{walk_window, RawFrame};
use crate::caller::{CallerResolver, Resolution};
use std::sync::{Arc, Mutex, OnceLock};

pub struct FrameStackResolver {
    window: Mutex<Vec<RawFrame>>,
}

impl FrameStackResolver {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Vec::new()),
        }
    }

    /// Process-wide instance the embedding layer records into.
    pub fn global() -> &'static Arc<FrameStackResolver> {
        static GLOBAL: OnceLock<Arc<FrameStackResolver>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(FrameStackResolver::new()))
    }

    /// Replace the recorded window; index 0 is the innermost frame.
    pub fn set_window(&self, frames: Vec<RawFrame>) {
        *self.window.lock().expect("frame window lock poisoned") = frames;
    }

    /// Push one frame onto the innermost end of the window.
    pub fn push(&self, frame: RawFrame) {
        self.window
            .lock()
            .expect("frame window lock poisoned")
            .insert(0, frame);
    }

    /// Pop the innermost frame.
    pub fn pop(&self) -> Option<RawFrame> {
        let mut window = self.window.lock().expect("frame window lock poisoned");
        if window.is_empty() {
            None
        } else {
            Some(window.remove(0))
        }
    }

    pub fn clear(&self) {
        self.window.lock().expect("frame window lock poisoned").clear();
    }
}

impl Default for FrameStackResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CallerResolver for FrameStackResolver {
    fn name(&self) -> &'static str {
        "frame-stack"
    }

    fn probe(&self) -> bool {
        true
    }

    fn resolve(&self, skip: usize) -> Option<Resolution> {
        let frames = self
            .window
            .lock()
            .expect("frame window lock poisoned")
            .clone();
        walk_window(&frames, skip, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_recorded_window() {
        let resolver = FrameStackResolver::new();
        resolver.set_window(vec![RawFrame::at("/app/vendor/left-pad/src/lib.rs", 3)]);

        let resolution = resolver.resolve(0).unwrap();
        assert_eq!(resolution.info.identity.as_str(), "left-pad");
        assert!(resolution.needs_validation);
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let resolver = FrameStackResolver::new();
        assert!(resolver.resolve(0).is_none());
    }

    #[test]
    fn test_push_pop_order() {
        let resolver = FrameStackResolver::new();
        resolver.push(RawFrame::at("/app/vendor/a/src/lib.rs", 1));
        resolver.push(RawFrame::at("/app/vendor/b/src/lib.rs", 2));

        // Innermost frame attributes the access.
        let resolution = resolver.resolve(0).unwrap();
        assert_eq!(resolution.info.identity.as_str(), "b");

        resolver.pop();
        let resolution = resolver.resolve(0).unwrap();
        assert_eq!(resolution.info.identity.as_str(), "a");
    }

    #[test]
    fn test_eval_detection_runs_on_this_path() {
        let resolver = FrameStackResolver::new();
        resolver.set_window(vec![
            RawFrame::at("/app/vendor/a/src/lib.rs", 1),
            RawFrame::default().marked_eval(),
        ]);

        let resolution = resolver.resolve(0).unwrap();
        assert!(resolution.eval_tainted);
    }
}
