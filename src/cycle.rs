//! Process-wide cycle-detection registry.
//!
//! No graph traversal is performed. Instead: every target this process is
//! currently building a recipe (or `redo-unlocked` check) for is recorded
//! here for the duration of that child's lifetime. When the Orchestrator's
//! Phase 2 cannot acquire a target's lock, the only process that could be
//! holding it is one of our own ancestors in the call chain — and if the
//! target's name is already in this registry, that ancestor is *us*, which
//! means the dependency graph has a cycle back to a target we are already
//! building.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// The registry of targets currently being built (recipe running, or
/// `redo-unlocked` check in flight) by this process or one of its
/// in-process ancestors.
#[derive(Debug, Default)]
pub struct CycleRegistry {
    building: Mutex<HashSet<String>>,
}

impl CycleRegistry {
    pub fn new() -> Self {
        CycleRegistry {
            building: Mutex::new(HashSet::new()),
        }
    }

    /// True if `target` is already recorded as being built by an
    /// in-process ancestor.
    pub fn contains(&self, target: &str) -> bool {
        self.building
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(target)
    }

    /// Register `target` as being built, returning an RAII guard that
    /// deregisters it on drop. Registration and deregistration must
    /// always be paired, even on early return from a `BuildJob`, which is
    /// why this is a guard rather than a bare insert/remove pair.
    pub fn enter<'a>(&'a self, target: &str) -> CycleGuard<'a> {
        self.building
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.to_string());
        CycleGuard {
            registry: self,
            target: target.to_string(),
        }
    }
}

/// Deregisters its target from the owning [`CycleRegistry`] on drop.
#[derive(Debug)]
pub struct CycleGuard<'a> {
    registry: &'a CycleRegistry,
    target: String,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .building
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.target);
    }
}

impl CycleRegistry {
    /// Same as [`CycleRegistry::enter`], but for callers (BuildJob
    /// completion closures handed to [`crate::token::JobController`])
    /// that need a guard with no borrow on the registry's lifetime. Takes
    /// an `Arc` so the guard can be moved into a `'static` closure.
    pub fn enter_owned(self: &Arc<Self>, target: &str) -> CycleGuardOwned {
        self.building
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.to_string());
        CycleGuardOwned {
            registry: Arc::clone(self),
            target: target.to_string(),
        }
    }
}

/// Owned counterpart of [`CycleGuard`]; see [`CycleRegistry::enter_owned`].
#[derive(Debug)]
pub struct CycleGuardOwned {
    registry: Arc<CycleRegistry>,
    target: String,
}

impl Drop for CycleGuardOwned {
    fn drop(&mut self) {
        self.registry
            .building
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_contains_nothing() {
        let reg = CycleRegistry::new();
        assert!(!reg.contains("a"));
    }

    #[test]
    fn enter_registers_until_dropped() {
        let reg = CycleRegistry::new();
        {
            let _guard = reg.enter("a");
            assert!(reg.contains("a"));
        }
        assert!(!reg.contains("a"));
    }

    #[test]
    fn independent_targets_do_not_interfere() {
        let reg = CycleRegistry::new();
        let _a = reg.enter("a");
        let _b = reg.enter("b");
        assert!(reg.contains("a"));
        assert!(reg.contains("b"));
        assert!(!reg.contains("c"));
    }
}
