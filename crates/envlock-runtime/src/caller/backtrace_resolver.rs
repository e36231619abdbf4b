//! Native stack capture strategy
//!
//! Captures the real call stack through the `backtrace` crate. This
//! strategy cannot be retargeted by reassigning the stack-formatting hook,
//! so its resolutions are trusted without spoofing validation and eval
//! detection does not apply. It is only usable when symbol filenames
//! resolve (debug info present); `probe` checks exactly that.

use crate::caller::frames::{RawFrame, MAX_DECISION_FRAMES};
use crate::caller::{CallerResolver, Resolution};
use crate::integrity;

/// Extra frames allowed for the capture machinery itself before the
/// decision window begins.
const CAPTURE_SLACK: usize = 8;

pub struct BacktraceResolver {
    _private: (),
}

impl BacktraceResolver {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for BacktraceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CallerResolver for BacktraceResolver {
    fn name(&self) -> &'static str {
        "backtrace"
    }

    fn probe(&self) -> bool {
        let capture = integrity::trusted_capture();
        capture(CAPTURE_SLACK).iter().any(|f| f.source.is_some())
    }

    fn resolve(&self, skip: usize) -> Option<Resolution> {
        let capture = integrity::trusted_capture();
        let frames = capture(skip + MAX_DECISION_FRAMES + CAPTURE_SLACK);
        // Walker filtering already skips the engine's own frames, so the
        // requested skip applies to the full captured window.
        let mut resolution = crate::caller::frames::walk_window(&frames, skip, false)?;
        resolution.needs_validation = false;
        Some(resolution)
    }
}

/// Capture up to `limit` raw frames from the live call stack.
///
/// This is the capture primitive pinned by the integrity monitor; callers
/// go through [`integrity::trusted_capture`] rather than calling it
/// directly.
pub fn capture_frames(limit: usize) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    backtrace::trace(|frame| {
        let mut raw = RawFrame::default();
        backtrace::resolve_frame(frame, |symbol| {
            if raw.source.is_none() {
                if let Some(path) = symbol.filename() {
                    raw.source = Some(path.to_path_buf());
                }
            }
            if raw.line.is_none() {
                raw.line = symbol.lineno();
            }
            if raw.column.is_none() {
                raw.column = symbol.colno();
            }
            if raw.function_name.is_none() {
                raw.function_name = symbol.name().map(|n| n.to_string());
            }
        });
        frames.push(raw);
        frames.len() < limit
    });
    frames
}
