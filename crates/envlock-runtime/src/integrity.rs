//! Capture-path integrity
//!
//! Attribution is only as trustworthy as the machinery that captures the
//! call stack. This module pins the capture function at first use so a
//! later swap cannot redirect attribution, and offers a freezable slot
//! for the frame formatting hook. Failure to freeze is detected, not
//! fatal: the decision engine consults the flags and falls back to the
//! pinned path.

use crate::caller::backtrace_resolver;
use crate::caller::frames::RawFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

/// Signature of the stack capture primitive.
pub type CaptureFn = fn(usize) -> Vec<RawFrame>;

/// Signature of the frame formatting hook.
pub type FormatFn = fn(&[RawFrame]) -> String;

static PINNED_CAPTURE: OnceLock<CaptureFn> = OnceLock::new();

/// The capture function pinned at first call. Every capture after the
/// first goes through the same function pointer, whatever has happened
/// to the ambient environment since.
pub fn trusted_capture() -> CaptureFn {
    *PINNED_CAPTURE.get_or_init(|| backtrace_resolver::capture_frames)
}

/// A single-owner slot for the frame formatting hook.
///
/// Once frozen, further installs fail and are counted as tampering
/// attempts. Freezing itself can fail only if the slot was poisoned,
/// which is likewise recorded.
pub struct HookSlot {
    hook: Mutex<Option<FormatFn>>,
    frozen: AtomicBool,
    tamper_detected: AtomicBool,
    freeze_failed: AtomicBool,
}

impl HookSlot {
    pub const fn new() -> Self {
        Self {
            hook: Mutex::new(None),
            frozen: AtomicBool::new(false),
            tamper_detected: AtomicBool::new(false),
            freeze_failed: AtomicBool::new(false),
        }
    }

    /// Install a hook. Fails once the slot is frozen.
    pub fn install(&self, hook: FormatFn) -> bool {
        if self.frozen.load(Ordering::Acquire) {
            self.tamper_detected.store(true, Ordering::Release);
            return false;
        }
        match self.hook.lock() {
            Ok(mut slot) => {
                *slot = Some(hook);
                true
            }
            Err(_) => {
                self.tamper_detected.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Freeze the slot so the installed hook can no longer change.
    pub fn freeze(&self) {
        if self.hook.lock().is_err() {
            self.freeze_failed.store(true, Ordering::Release);
            return;
        }
        self.frozen.store(true, Ordering::Release);
    }

    pub fn format(&self, frames: &[RawFrame]) -> Option<String> {
        match self.hook.lock() {
            Ok(slot) => (*slot).map(|hook| hook(frames)),
            Err(_) => None,
        }
    }

    pub fn has_hook(&self) -> bool {
        self.hook.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn was_tampering_detected(&self) -> bool {
        self.tamper_detected.load(Ordering::Acquire)
    }

    pub fn freeze_failed(&self) -> bool {
        self.freeze_failed.load(Ordering::Acquire)
    }
}

impl Default for HookSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide formatting-hook slot that embeddings record into.
pub fn global_hook_slot() -> &'static HookSlot {
    static SLOT: OnceLock<HookSlot> = OnceLock::new();
    SLOT.get_or_init(HookSlot::new)
}

/// Process-wide integrity state consulted by the decision engine.
pub struct IntegrityMonitor {
    slot: &'static HookSlot,
    tampering_at_install: bool,
}

impl IntegrityMonitor {
    /// Pin the capture path and freeze the global hook slot.
    pub fn install() -> Self {
        // Force the pin before any untrusted code has had a chance to
        // influence it.
        let _ = trusted_capture();

        let slot = global_hook_slot();
        // A hook already present when protection comes up means the
        // formatting path was altered before the session existed.
        let tampering_at_install = slot.has_hook();
        slot.freeze();
        Self {
            slot,
            tampering_at_install,
        }
    }

    pub fn hook_slot(&self) -> &'static HookSlot {
        self.slot
    }

    pub fn was_tampering_detected(&self) -> bool {
        self.tampering_at_install || self.slot.was_tampering_detected()
    }

    pub fn freeze_failed(&self) -> bool {
        self.slot.freeze_failed()
    }
}
