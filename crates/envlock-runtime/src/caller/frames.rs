//! Frame window representation and the shared stack walk
//!
//! Both resolution strategies reduce to the same operation: walk a bounded
//! window of raw frames, skip runtime/engine internals, pick the first
//! frame with a resolvable source location, and (on the portable path)
//! flag eval-like frames anywhere in the window.

use crate::caller::{is_internal_path, CallerInfo, Resolution};
use crate::identity::Identity;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Frame cap for access decisions.
pub const MAX_DECISION_FRAMES: usize = 30;

/// Frame cap for diagnostic stack formatting.
pub const MAX_DIAGNOSTIC_FRAMES: usize = 15;

/// Function names associated with dynamic code evaluation.
const DYNAMIC_EVAL_FUNCTIONS: &[&str] = &["eval", "Function", "new Function", "execute_dynamic"];

/// Placeholder for frames without a function name.
pub const ANONYMOUS_FUNCTION: &str = "<anonymous>";

fn eval_source_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\[eval\]|eval at |<anonymous>)").expect("eval source pattern is valid")
    })
}

/// A single captured or recorded stack frame, before attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub source: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub function_name: Option<String>,
    /// The producer marked this frame as eval (e.g. the stack API said so).
    pub eval_marked: bool,
    /// Eval-origin metadata attached by the producer, if any.
    pub eval_origin: Option<String>,
    pub is_constructor: bool,
}

impl RawFrame {
    /// Frame at a concrete source location.
    pub fn at(source: impl Into<PathBuf>, line: u32) -> Self {
        RawFrame {
            source: Some(source.into()),
            line: Some(line),
            column: Some(0),
            ..RawFrame::default()
        }
    }

    pub fn with_function(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn marked_eval(mut self) -> Self {
        self.eval_marked = true;
        self
    }

    /// Whether this frame's source location can attribute an access.
    /// Synthetic sources (eval output, anonymous scripts) do not qualify.
    pub fn has_resolvable_source(&self) -> bool {
        match &self.source {
            None => false,
            Some(path) => {
                let text = path.to_string_lossy();
                !text.is_empty() && !eval_source_pattern().is_match(&text)
            }
        }
    }

    /// Eval heuristics: any one signal flags the frame.
    pub fn is_eval_like(&self) -> bool {
        if self.eval_marked || self.eval_origin.is_some() {
            return true;
        }
        if let Some(name) = &self.function_name {
            if DYNAMIC_EVAL_FUNCTIONS.contains(&name.as_str()) {
                return true;
            }
        }
        if let Some(path) = &self.source {
            if eval_source_pattern().is_match(&path.to_string_lossy()) {
                return true;
            }
        }
        // No source location but a non-anonymous function name: the usual
        // shape of generated code.
        if self.source.is_none() {
            if let Some(name) = &self.function_name {
                if !name.is_empty() && name != ANONYMOUS_FUNCTION {
                    return true;
                }
            }
        }
        false
    }
}

/// Walk a frame window and attribute the access.
///
/// Frames before `skip` are ignored; the window is capped at
/// [`MAX_DECISION_FRAMES`]. With `detect_eval`, an eval-like frame
/// anywhere in the window taints the resolution as a whole.
pub fn walk_window(frames: &[RawFrame], skip: usize, detect_eval: bool) -> Option<Resolution> {
    let window_end = frames.len().min(skip.saturating_add(MAX_DECISION_FRAMES));
    let window = frames.get(skip..window_end)?;

    let eval_tainted = detect_eval && window.iter().any(RawFrame::is_eval_like);

    for frame in window {
        if !frame.has_resolvable_source() {
            continue;
        }
        let source = frame.source.clone()?;
        if is_internal_path(&source) {
            continue;
        }

        let identity = Identity::from_path(&source);
        let info = CallerInfo {
            identity,
            line: frame.line.unwrap_or(0),
            column: frame.column.unwrap_or(0),
            function_name: frame
                .function_name
                .clone()
                .unwrap_or_else(|| ANONYMOUS_FUNCTION.to_string()),
            is_eval: frame.is_eval_like(),
            is_constructor: frame.is_constructor,
            source,
        };
        return Some(Resolution {
            info,
            eval_tainted,
            // Overridden by the strategy that performed the walk.
            needs_validation: true,
        });
    }

    None
}

/// Render a frame window for diagnostics, capped at
/// [`MAX_DIAGNOSTIC_FRAMES`].
pub fn format_frames(frames: &[RawFrame]) -> String {
    let mut out = String::new();
    for frame in frames.iter().take(MAX_DIAGNOSTIC_FRAMES) {
        let name = frame
            .function_name
            .as_deref()
            .unwrap_or(ANONYMOUS_FUNCTION);
        match (&frame.source, frame.line) {
            (Some(src), Some(line)) => {
                out.push_str(&format!("    at {} ({}:{})\n", name, src.display(), line));
            }
            (Some(src), None) => {
                out.push_str(&format!("    at {} ({})\n", name, src.display()));
            }
            _ => out.push_str(&format!("    at {}\n", name)),
        }
    }
    if frames.len() > MAX_DIAGNOSTIC_FRAMES {
        out.push_str(&format!(
            "    ... {} more\n",
            frames.len() - MAX_DIAGNOSTIC_FRAMES
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_picks_first_external_frame() {
        let frames = vec![
            RawFrame::at("/app/vendor/envlock/lib/guard.rs", 10),
            RawFrame::at("/app/vendor/left-pad/src/lib.rs", 42).with_function("pad"),
            RawFrame::at("/app/src/main.rs", 7),
        ];

        let resolution = walk_window(&frames, 0, true).unwrap();
        assert_eq!(resolution.info.identity.as_str(), "left-pad");
        assert_eq!(resolution.info.line, 42);
        assert_eq!(resolution.info.function_name, "pad");
        assert!(!resolution.eval_tainted);
    }

    #[test]
    fn test_walk_respects_skip() {
        let frames = vec![
            RawFrame::at("/app/vendor/a/src/lib.rs", 1),
            RawFrame::at("/app/vendor/b/src/lib.rs", 2),
        ];

        let resolution = walk_window(&frames, 1, true).unwrap();
        assert_eq!(resolution.info.identity.as_str(), "b");
    }

    #[test]
    fn test_walk_empty_window() {
        assert!(walk_window(&[], 0, true).is_none());
        let frames = vec![RawFrame::at("/app/vendor/a/src/lib.rs", 1)];
        assert!(walk_window(&frames, 5, true).is_none());
    }

    #[test]
    fn test_eval_anywhere_taints_whole_window() {
        let frames = vec![
            RawFrame::at("/app/vendor/a/src/lib.rs", 1),
            RawFrame::default().with_function("eval"),
        ];

        let resolution = walk_window(&frames, 0, true).unwrap();
        assert_eq!(resolution.info.identity.as_str(), "a");
        assert!(!resolution.info.is_eval);
        assert!(resolution.eval_tainted);
    }

    #[test]
    fn test_eval_detection_can_be_disabled() {
        let frames = vec![
            RawFrame::at("/app/vendor/a/src/lib.rs", 1),
            RawFrame::default().with_function("eval"),
        ];

        let resolution = walk_window(&frames, 0, false).unwrap();
        assert!(!resolution.eval_tainted);
    }

    #[test]
    fn test_synthetic_source_is_not_resolvable() {
        let frame = RawFrame::at("[eval]", 1);
        assert!(!frame.has_resolvable_source());
        assert!(frame.is_eval_like());

        let frame = RawFrame::at("eval at bar (/app/x.rs:1:1)", 3);
        assert!(!frame.has_resolvable_source());
    }

    #[rstest::rstest]
    #[case(RawFrame::default().marked_eval(), true)]
    #[case(RawFrame {
        eval_origin: Some("eval at foo".to_string()),
        ..RawFrame::default()
    }, true)]
    #[case(RawFrame::default().with_function("Function"), true)]
    #[case(RawFrame::default().with_function("generated_helper"), true)]
    #[case(RawFrame::default().with_function(ANONYMOUS_FUNCTION), false)]
    #[case(RawFrame::at("/app/src/main.rs", 1), false)]
    fn test_eval_heuristics(#[case] frame: RawFrame, #[case] expected: bool) {
        assert_eq!(frame.is_eval_like(), expected);
    }

    #[test]
    fn test_no_source_named_function_is_eval_like_but_unresolvable() {
        let frame = RawFrame::default().with_function("mystery");
        assert!(frame.is_eval_like());
        assert!(!frame.has_resolvable_source());
    }

    #[test]
    fn test_format_frames_caps_output() {
        let frames: Vec<RawFrame> = (0..20)
            .map(|i| RawFrame::at(format!("/app/f{}.rs", i), i as u32))
            .collect();
        let text = format_frames(&frames);
        assert!(text.contains("... 5 more"));
        assert_eq!(text.matches("    at ").count(), MAX_DIAGNOSTIC_FRAMES);
    }
}
