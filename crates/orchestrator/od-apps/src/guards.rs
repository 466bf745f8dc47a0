//! Per-app concurrency guards.
//!
//! `processing` is held for the whole duration of a run or redeploy; the
//! watchdog skips apps inside it. `creating` rejects duplicate concurrent
//! creates by name. Both release on drop, so every exit path — success,
//! error, panic unwind — frees the slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct GuardSets {
    processing: Mutex<HashSet<String>>,
    creating: Mutex<HashSet<String>>,
}

impl GuardSets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_processing(self: &Arc<Self>, name: &str) -> Option<ProcessingGuard> {
        let mut set = self.processing.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(name.to_string()) {
            Some(ProcessingGuard { sets: Arc::clone(self), name: name.to_string() })
        } else {
            None
        }
    }

    pub fn try_creating(self: &Arc<Self>, name: &str) -> Option<CreatingGuard> {
        let mut set = self.creating.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(name.to_string()) {
            Some(CreatingGuard { sets: Arc::clone(self), name: name.to_string() })
        } else {
            None
        }
    }

    pub fn is_processing(&self, name: &str) -> bool {
        self.processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

pub struct ProcessingGuard {
    sets: Arc<GuardSets>,
    name: String,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.sets
            .processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

pub struct CreatingGuard {
    sets: Arc<GuardSets>,
    name: String,
}

impl Drop for CreatingGuard {
    fn drop(&mut self) {
        self.sets
            .creating
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_excludes_second_holder() {
        let sets = GuardSets::new();
        let guard = sets.try_processing("app").unwrap();
        assert!(sets.try_processing("app").is_none());
        assert!(sets.is_processing("app"));
        drop(guard);
        assert!(!sets.is_processing("app"));
        assert!(sets.try_processing("app").is_some());
    }

    #[test]
    fn creating_is_per_name() {
        let sets = GuardSets::new();
        let _a = sets.try_creating("a").unwrap();
        assert!(sets.try_creating("a").is_none());
        assert!(sets.try_creating("b").is_some());
    }

    #[test]
    fn guard_releases_on_unwind() {
        let sets = GuardSets::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = sets.try_processing("app").unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!sets.is_processing("app"));
    }
}
