//! Async context propagation
//!
//! A deferred continuation has no meaningful call stack of its own: by the
//! time it runs, the frames that created it are gone. The propagator keeps
//! a per-execution-context LIFO stack of identities so attribution follows
//! each unit of deferred work from its creation site, not from whatever
//! the executor's stack happens to look like when the continuation fires.
//!
//! Scheduling integration is explicit (spec'd units with ids and
//! before/after hooks) rather than hidden thread-local state, so the
//! propagation is auditable and testable without faking a runtime.

use crate::identity::Identity;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Settled units are evicted in batches once this many have completed.
const SETTLED_EVICTION_THRESHOLD: usize = 1000;

/// Hard ceiling on live unit->origin mappings. Crossing it clears the
/// whole table: attribution precision is traded for bounded memory.
const UNIT_TABLE_CEILING: usize = 10_000;

/// Identifier of a deferred unit of work, assigned by the embedding.
pub type UnitId = u64;

#[derive(Debug, Default)]
struct PropagatorState {
    /// LIFO identity stack; seeded with `__main__`, never empty.
    stack: Vec<Identity>,
    origins: HashMap<UnitId, Identity>,
    settled: HashSet<UnitId>,
}

pub struct ContextPropagator {
    state: Mutex<PropagatorState>,
    enabled: AtomicBool,
}

impl ContextPropagator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PropagatorState {
                stack: vec![Identity::main()],
                ..PropagatorState::default()
            }),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Disable tracking and drop all stored origins.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let mut state = self.lock();
        state.stack = vec![Identity::main()];
        state.origins.clear();
        state.settled.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Record a deferred unit's origin at creation time.
    ///
    /// A unit created by another unit inherits the parent's origin; a root
    /// unit captures whatever identity `capture` can produce at the
    /// creation site, defaulting to `__main__`.
    pub fn on_unit_created<F>(&self, unit: UnitId, parent: Option<UnitId>, capture: F)
    where
        F: FnOnce() -> Option<Identity>,
    {
        if !self.is_enabled() {
            return;
        }

        let inherited = parent.and_then(|p| self.lock().origins.get(&p).cloned());
        let origin = inherited
            .or_else(capture)
            .unwrap_or_else(Identity::main);

        let mut state = self.lock();
        if state.origins.len() >= UNIT_TABLE_CEILING {
            // Emergency clear rather than unbounded growth.
            state.origins.clear();
            state.settled.clear();
        }
        state.origins.insert(unit, origin);
    }

    /// Push the unit's stored identity immediately before its
    /// continuation executes.
    pub fn before_execute(&self, unit: UnitId) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        let origin = state
            .origins
            .get(&unit)
            .cloned()
            .unwrap_or_else(Identity::main);
        state.stack.push(origin);
    }

    /// Pop immediately after the continuation returns.
    pub fn after_execute(&self, _unit: UnitId) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        // The seed entry stays.
        if state.stack.len() > 1 {
            state.stack.pop();
        }
    }

    /// Mark a unit settled; batch-evict once enough have settled.
    pub fn mark_settled(&self, unit: UnitId) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        state.settled.insert(unit);
        if state.settled.len() >= SETTLED_EVICTION_THRESHOLD {
            let settled = std::mem::take(&mut state.settled);
            for id in settled {
                state.origins.remove(&id);
            }
        }
    }

    /// Identity attributed to the currently executing context, if
    /// tracking is active.
    pub fn current(&self) -> Option<Identity> {
        if !self.is_enabled() {
            return None;
        }
        self.lock().stack.last().cloned()
    }

    /// Number of live unit->origin mappings (resource-bound visibility).
    pub fn tracked_units(&self) -> usize {
        self.lock().origins.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PropagatorState> {
        self.state.lock().expect("propagator lock poisoned")
    }
}

impl Default for ContextPropagator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_propagator_yields_nothing() {
        let propagator = ContextPropagator::new();
        assert_eq!(propagator.current(), None);
    }

    #[test]
    fn test_enabled_baseline_is_main() {
        let propagator = ContextPropagator::new();
        propagator.enable();
        assert_eq!(propagator.current(), Some(Identity::main()));
    }

    #[test]
    fn test_unit_origin_survives_execution() {
        let propagator = ContextPropagator::new();
        propagator.enable();

        propagator.on_unit_created(1, None, || Some(Identity::named("left-pad")));
        propagator.before_execute(1);
        assert_eq!(propagator.current(), Some(Identity::named("left-pad")));
        propagator.after_execute(1);
        assert_eq!(propagator.current(), Some(Identity::main()));
    }

    #[test]
    fn test_child_inherits_parent_origin() {
        let propagator = ContextPropagator::new();
        propagator.enable();

        propagator.on_unit_created(1, None, || Some(Identity::named("a")));
        // A chained continuation created while nothing of `a` is on the
        // stack anymore still inherits `a`.
        propagator.on_unit_created(2, Some(1), || Some(Identity::named("wrong")));
        propagator.before_execute(2);
        assert_eq!(propagator.current(), Some(Identity::named("a")));
        propagator.after_execute(2);
    }

    #[test]
    fn test_nested_execution_is_lifo() {
        let propagator = ContextPropagator::new();
        propagator.enable();

        propagator.on_unit_created(1, None, || Some(Identity::named("a")));
        propagator.on_unit_created(2, None, || Some(Identity::named("b")));

        propagator.before_execute(1);
        propagator.before_execute(2);
        assert_eq!(propagator.current(), Some(Identity::named("b")));
        propagator.after_execute(2);
        assert_eq!(propagator.current(), Some(Identity::named("a")));
        propagator.after_execute(1);
        assert_eq!(propagator.current(), Some(Identity::main()));
    }

    #[test]
    fn test_capture_fallback_is_main() {
        let propagator = ContextPropagator::new();
        propagator.enable();

        propagator.on_unit_created(7, None, || None);
        propagator.before_execute(7);
        assert_eq!(propagator.current(), Some(Identity::main()));
        propagator.after_execute(7);
    }

    #[test]
    fn test_settled_units_are_batch_evicted() {
        let propagator = ContextPropagator::new();
        propagator.enable();

        for id in 0..(SETTLED_EVICTION_THRESHOLD as u64) {
            propagator.on_unit_created(id, None, || Some(Identity::named("x")));
        }
        assert_eq!(propagator.tracked_units(), SETTLED_EVICTION_THRESHOLD);

        for id in 0..(SETTLED_EVICTION_THRESHOLD as u64) {
            propagator.mark_settled(id);
        }
        assert_eq!(propagator.tracked_units(), 0);
    }

    #[test]
    fn test_ceiling_triggers_emergency_clear() {
        let propagator = ContextPropagator::new();
        propagator.enable();

        for id in 0..(UNIT_TABLE_CEILING as u64 + 1) {
            propagator.on_unit_created(id, None, || Some(Identity::named("x")));
        }
        // The table was cleared at the ceiling and restarted.
        assert!(propagator.tracked_units() <= 1);
    }

    #[test]
    fn test_disable_resets_everything() {
        let propagator = ContextPropagator::new();
        propagator.enable();
        propagator.on_unit_created(1, None, || Some(Identity::named("a")));
        propagator.before_execute(1);

        propagator.disable();
        assert_eq!(propagator.current(), None);
        assert_eq!(propagator.tracked_units(), 0);
    }
}
