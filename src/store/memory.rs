//! In-memory store with one lock per project.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{ProjectState, StatePatch, StateStore};
use crate::error::{LoopError, Result};

type Slot = Arc<Mutex<Option<ProjectState>>>;

/// Per-project slots behind a map.
///
/// The map lock is held only to find or insert a slot; the read-modify-write
/// of a project happens under that project's own mutex.
#[derive(Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_slot(&self, project_id: &str) -> Result<Option<Slot>> {
        let slots = self
            .slots
            .read()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        Ok(slots.get(project_id).cloned())
    }

    fn slot(&self, project_id: &str) -> Result<Slot> {
        if let Some(slot) = self.existing_slot(project_id)? {
            return Ok(slot);
        }
        let mut slots = self
            .slots
            .write()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        Ok(slots.entry(project_id.to_string()).or_default().clone())
    }
}

impl StateStore for MemoryStore {
    fn read(&self, project_id: &str) -> Result<ProjectState> {
        let slot = self
            .existing_slot(project_id)?
            .ok_or_else(|| LoopError::NotFound(project_id.to_string()))?;
        let guard = slot.lock().map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        guard
            .clone()
            .ok_or_else(|| LoopError::NotFound(project_id.to_string()))
    }

    fn apply(
        &self,
        project_id: &str,
        update: &mut dyn FnMut(&ProjectState) -> StatePatch,
    ) -> Result<ProjectState> {
        let slot = self.slot(project_id)?;
        let mut guard = slot.lock().map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;

        let mut state = guard.take().unwrap_or_else(|| ProjectState::new(project_id));
        let patch = update(&state);
        patch.apply_to(&mut state);
        *guard = Some(state.clone());

        Ok(state)
    }

    fn list_projects(&self) -> Result<Vec<String>> {
        let slots = self
            .slots
            .read()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        let mut ids = Vec::new();
        for (id, slot) in slots.iter() {
            let written = slot
                .lock()
                .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?
                .is_some();
            if written {
                ids.push(id.clone());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    #[test]
    fn test_read_unknown_is_not_found() {
        let store = MemoryStore::new();
        let err = store.read("ghost").unwrap_err();
        assert!(matches!(err, LoopError::NotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_write_creates_on_first_write() {
        let store = MemoryStore::new();
        let state = store
            .write("alpha", StatePatch::new().files(vec!["a.rs".to_string()]))
            .unwrap();
        assert_eq!(state.project_id, "alpha");
        assert_eq!(store.read("alpha").unwrap().files_created, vec!["a.rs"]);
    }

    #[test]
    fn test_read_or_new_for_unknown() {
        let store = MemoryStore::new();
        let state = store.read_or_new("fresh").unwrap();
        assert_eq!(state.project_id, "fresh");
        assert!(store.read("fresh").is_err());
    }

    #[test]
    fn test_apply_sees_current_state() {
        let store = MemoryStore::new();
        store.write("alpha", StatePatch::new().loop_count(4)).unwrap();
        let state = store
            .apply("alpha", &mut |s| StatePatch::new().loop_count(s.loop_count + 1))
            .unwrap();
        assert_eq!(state.loop_count, 5);
    }

    #[test]
    fn test_write_cannot_lower_loop_count() {
        let store = MemoryStore::new();
        store.write("alpha", StatePatch::new().loop_count(5)).unwrap();
        let state = store.write("alpha", StatePatch::new().loop_count(2)).unwrap();
        assert_eq!(state.loop_count, 5);
    }

    #[test]
    fn test_list_projects_sorted() {
        let store = MemoryStore::new();
        store.write("beta", StatePatch::new()).unwrap();
        store.write("alpha", StatePatch::new()).unwrap();
        let _ = store.read("gamma");
        assert_eq!(store.list_projects().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_concurrent_appends_same_project_lose_nothing() {
        let store = MemoryStore::new();
        std::thread::scope(|s| {
            for t in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..50 {
                        store
                            .write("shared", StatePatch::new().files(vec![format!("{}-{}", t, i)]))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(store.read("shared").unwrap().files_created.len(), 400);
    }

    #[test]
    fn test_concurrent_counter_increments_serialize() {
        let store = MemoryStore::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for _ in 0..25 {
                        store
                            .apply("shared", &mut |st| StatePatch::new().loop_count(st.loop_count + 1))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(store.read("shared").unwrap().loop_count, 100);
    }

    #[test]
    fn test_different_projects_do_not_block() {
        let store = MemoryStore::new();
        store.write("slow", StatePatch::new()).unwrap();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            let store = &store;
            let barrier = &barrier;
            s.spawn(move || {
                store
                    .apply("slow", &mut |_| {
                        barrier.wait();
                        std::thread::sleep(Duration::from_millis(300));
                        StatePatch::new()
                    })
                    .unwrap();
            });

            barrier.wait();
            let started = Instant::now();
            store.write("fast", StatePatch::new().loop_count(1)).unwrap();
            assert!(started.elapsed() < Duration::from_millis(250));
        });
    }
}
