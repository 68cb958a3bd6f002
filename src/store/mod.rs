//! Project State Store.
//!
//! Every component reads and writes project state through the `StateStore`
//! trait, handed to it at construction. Writes for one project id are
//! serialized; writes for different project ids do not coordinate.
//!
//! Two backends:
//! - **MemoryStore**: per-project slots in memory, for tests and embedding
//! - **TaskStore**: JSONL append log (source of truth) plus a SQLite index
//!
//! # Example
//!
//! ```ignore
//! use agentloop::store::{MemoryStore, StatePatch, StateStore};
//!
//! let store = MemoryStore::new();
//! store.write("alpha", StatePatch::new().files(vec!["src/lib.rs".into()]))?;
//! let state = store.read("alpha")?;
//! ```

mod memory;
mod patch;
mod records;
mod task_store;

pub use memory::MemoryStore;
pub use patch::StatePatch;
pub use records::{
    DriverPhase, DriverState, ExecutionRecord, ExecutionStatus, FeedbackEntry, FeedbackKind, FrozenAlert,
    ProjectState, ReflectionScore, StagedResult, WorkerStatus, generate_reflection_id, now_ms, rerun_key,
};
pub use task_store::{TaskStore, compute_project_hash};

use crate::error::{LoopError, Result};

/// Durable per-project state with atomic partial writes.
pub trait StateStore: Send + Sync {
    /// Read a project's state; `NotFound` for an unseen id.
    fn read(&self, project_id: &str) -> Result<ProjectState>;

    /// Conditional update: `update` sees the current state (or a fresh one
    /// for an unseen id) under the project's lock and returns the patch to
    /// merge. Returns the state after the merge.
    fn apply(
        &self,
        project_id: &str,
        update: &mut dyn FnMut(&ProjectState) -> StatePatch,
    ) -> Result<ProjectState>;

    /// Project ids known to the store.
    fn list_projects(&self) -> Result<Vec<String>>;

    /// Merge a constant patch, creating the record if absent.
    fn write(&self, project_id: &str, patch: StatePatch) -> Result<ProjectState> {
        let mut patch = Some(patch);
        self.apply(project_id, &mut |_| patch.take().unwrap_or_default())
    }

    /// Read, falling back to an empty state for an unseen id.
    fn read_or_new(&self, project_id: &str) -> Result<ProjectState> {
        match self.read(project_id) {
            Err(LoopError::NotFound(_)) => Ok(ProjectState::new(project_id)),
            other => other,
        }
    }
}
