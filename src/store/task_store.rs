//! TaskStore implementation with JSONL append log and SQLite index.
//!
//! The TaskStore persists project state using a dual-storage approach:
//! - **JSONL file**: Append-only log of every post-write snapshot (source of truth)
//! - **SQLite database**: Latest snapshot per project for fast reads (rebuilt from JSONL)
//!
//! Each project has its own lock, held for the whole read-modify-write. The
//! log file and the SQLite connection have their own mutexes, held only for
//! a single append or statement, so writes to different projects interleave
//! freely.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use super::{ProjectState, StatePatch, StateStore};
use crate::error::{LoopError, Result};

/// Meta key holding the number of log lines the index reflects
const LOG_LINES_KEY: &str = "log_lines";

/// Compact once the log holds this many lines per project
const COMPACT_RATIO: usize = 16;

/// TaskStore manages project state with JSONL persistence and SQLite indexing.
pub struct TaskStore {
    /// Base directory for this workspace's store
    base_dir: PathBuf,

    /// Path to the JSONL file
    jsonl_path: PathBuf,

    /// Serializes appends to the JSONL file
    log_lock: Mutex<()>,

    /// SQLite connection for reads
    db: Mutex<Connection>,

    /// One lock per project id
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Open or create a TaskStore for the given workspace directory.
    ///
    /// The store is created at `<data_local_dir>/agentloop/<workspace-hash>/.taskstore/`.
    pub fn open(workspace_dir: &Path) -> Result<Self> {
        let workspace_hash = compute_project_hash(workspace_dir)?;
        let base_dir = dirs::data_local_dir()
            .ok_or_else(|| LoopError::StoreUnavailable("Cannot determine data directory".to_string()))?
            .join("agentloop")
            .join(&workspace_hash);

        Self::open_at(&base_dir)
    }

    /// Open or create a TaskStore at the specified directory.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        let store_dir = base_dir.join(".taskstore");
        fs::create_dir_all(&store_dir)?;

        let jsonl_path = store_dir.join("projects.jsonl");
        let db_path = store_dir.join("taskstore.db");

        let db = Connection::open(&db_path)?;
        Self::init_schema(&db)?;

        let store = Self {
            base_dir: base_dir.to_path_buf(),
            jsonl_path,
            log_lock: Mutex::new(()),
            db: Mutex::new(db),
            project_locks: Mutex::new(HashMap::new()),
        };

        store.rebuild_index_if_needed()?;
        info!("Opened task store at {}", store_dir.display());

        Ok(store)
    }

    /// Initialize the SQLite schema.
    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                loop_count INTEGER NOT NULL,
                phase TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_projects_updated ON projects(updated_at);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Bring the SQLite index in line with the JSONL log.
    ///
    /// The index records how many log lines it reflects. Any difference
    /// (a crash between append and upsert, a torn line, a lost database)
    /// triggers a full replay, and a replay or an oversized log compacts the
    /// log down to one snapshot per project.
    fn rebuild_index_if_needed(&self) -> Result<()> {
        if !self.jsonl_path.exists() {
            return Ok(());
        }

        let (latest, log_lines) = self.read_latest_snapshots()?;
        let indexed = self.indexed_log_lines()?;

        let stale = indexed != Some(log_lines);
        let oversized = log_lines > latest.len().max(1) * COMPACT_RATIO;
        if stale {
            warn!(
                "Index reflects {:?} log lines but log has {}, rebuilding",
                indexed, log_lines
            );
        }
        if stale || oversized {
            self.compact_log(&latest)?;
            self.rebuild_index_from(&latest, latest.len())?;
        }

        Ok(())
    }

    /// Replay the JSONL log, keeping the last snapshot per project.
    ///
    /// Returns the snapshots and the number of lines read.
    fn read_latest_snapshots(&self) -> Result<(BTreeMap<String, ProjectState>, usize)> {
        let mut latest = BTreeMap::new();
        if !self.jsonl_path.exists() {
            return Ok((latest, 0));
        }

        let reader = BufReader::new(File::open(&self.jsonl_path)?);
        let mut lines = 0;
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            lines = n + 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProjectState>(&line) {
                Ok(state) => {
                    latest.insert(state.project_id.clone(), state);
                }
                // A torn final line from a crash mid-append
                Err(e) => warn!("Skipping unreadable log line {}: {}", n + 1, e),
            }
        }

        Ok((latest, lines))
    }

    /// Rebuild the entire SQLite index from the JSONL file.
    pub fn rebuild_index(&self) -> Result<usize> {
        let (latest, log_lines) = self.read_latest_snapshots()?;
        self.rebuild_index_from(&latest, log_lines)
    }

    fn rebuild_index_from(&self, latest: &BTreeMap<String, ProjectState>, log_lines: usize) -> Result<usize> {
        let mut db = self.db()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM projects", [])?;
        for state in latest.values() {
            Self::upsert(&tx, state)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![LOG_LINES_KEY, log_lines.to_string()],
        )?;
        tx.commit()?;
        debug!("Rebuilt index with {} projects", latest.len());
        Ok(latest.len())
    }

    /// Rewrite the log as one line per project.
    fn compact_log(&self, latest: &BTreeMap<String, ProjectState>) -> Result<()> {
        let _guard = self
            .log_lock
            .lock()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;

        let tmp_path = self.jsonl_path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            for state in latest.values() {
                writeln!(file, "{}", serde_json::to_string(state)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.jsonl_path)?;
        info!("Compacted log to {} snapshots", latest.len());
        Ok(())
    }

    fn indexed_log_lines(&self) -> Result<Option<usize>> {
        let value: Option<String> = self
            .db()?
            .query_row("SELECT value FROM meta WHERE key = ?1", [LOG_LINES_KEY], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn upsert(db: &Connection, state: &ProjectState) -> Result<()> {
        let json_data = serde_json::to_string(state)?;
        db.execute(
            r#"
            INSERT OR REPLACE INTO projects (id, loop_count, phase, updated_at, json_data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                state.project_id,
                state.loop_count as i64,
                state.driver.phase.as_str(),
                state.updated_at,
                json_data,
            ],
        )?;
        Ok(())
    }

    fn append_to_log(&self, state: &ProjectState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let _guard = self
            .log_lock
            .lock()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.jsonl_path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| LoopError::StoreUnavailable(e.to_string()))
    }

    fn project_lock(&self, project_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .project_locks
            .lock()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        Ok(locks.entry(project_id.to_string()).or_default().clone())
    }

    fn load(&self, project_id: &str) -> Result<Option<ProjectState>> {
        let json: Option<String> = self
            .db()?
            .query_row("SELECT json_data FROM projects WHERE id = ?1", [project_id], |row| {
                row.get(0)
            })
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Get the base directory for this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the path to the JSONL log.
    pub fn log_path(&self) -> &Path {
        &self.jsonl_path
    }
}

impl StateStore for TaskStore {
    fn read(&self, project_id: &str) -> Result<ProjectState> {
        self.load(project_id)?
            .ok_or_else(|| LoopError::NotFound(project_id.to_string()))
    }

    fn apply(
        &self,
        project_id: &str,
        update: &mut dyn FnMut(&ProjectState) -> StatePatch,
    ) -> Result<ProjectState> {
        let lock = self.project_lock(project_id)?;
        let _guard = lock.lock().map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;

        let mut state = self
            .load(project_id)?
            .unwrap_or_else(|| ProjectState::new(project_id));
        let patch = update(&state);
        patch.apply_to(&mut state);

        // Log first (source of truth), then index
        self.append_to_log(&state)?;
        let mut db = self.db()?;
        let tx = db.transaction()?;
        Self::upsert(&tx, &state)?;
        tx.execute(
            r#"
            INSERT INTO meta (key, value) VALUES (?1, '1')
            ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1
            "#,
            [LOG_LINES_KEY],
        )?;
        tx.commit()?;

        Ok(state)
    }

    fn list_projects(&self) -> Result<Vec<String>> {
        let db = self.db()?;
        let mut stmt = db.prepare("SELECT id FROM projects ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

/// Compute a hash of the workspace directory path for storage isolation.
pub fn compute_project_hash(workspace_dir: &Path) -> Result<String> {
    let canonical = workspace_dir.canonicalize()?;

    let path_str = canonical.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(path_str.as_bytes());
    let result = hasher.finalize();

    // Take first 16 chars of hex
    Ok(hex::encode(&result[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionRecord;
    use tempfile::TempDir;

    fn create_temp_store() -> (TaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_open_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let _store = TaskStore::open_at(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join(".taskstore").exists());
        assert!(temp_dir.path().join(".taskstore/taskstore.db").exists());
    }

    #[test]
    fn test_write_and_read() {
        let (store, _temp) = create_temp_store();

        store
            .write(
                "alpha",
                StatePatch::new()
                    .next_recommended_step(Some("Run nova".into()))
                    .execution_record(ExecutionRecord::running("nova", 0, 1_000)),
            )
            .unwrap();

        let state = store.read("alpha").unwrap();
        assert_eq!(state.next_recommended_step.as_deref(), Some("Run nova"));
        assert_eq!(state.execution_log["nova"].len(), 1);
    }

    #[test]
    fn test_read_nonexistent() {
        let (store, _temp) = create_temp_store();
        assert!(matches!(store.read("ghost"), Err(LoopError::NotFound(_))));
    }

    #[test]
    fn test_merge_across_writes() {
        let (store, _temp) = create_temp_store();
        store.write("alpha", StatePatch::new().files(vec!["a".into()])).unwrap();
        store.write("alpha", StatePatch::new().files(vec!["b".into()])).unwrap();

        assert_eq!(store.read("alpha").unwrap().files_created, vec!["a", "b"]);
    }

    #[test]
    fn test_list_projects() {
        let (store, _temp) = create_temp_store();
        store.write("beta", StatePatch::new()).unwrap();
        store.write("alpha", StatePatch::new()).unwrap();
        store.write("alpha", StatePatch::new().loop_count(1)).unwrap();

        assert_eq!(store.list_projects().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_jsonl_persistence() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            store.write("alpha", StatePatch::new().loop_count(3)).unwrap();
        }

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            assert_eq!(store.read("alpha").unwrap().loop_count, 3);
        }
    }

    #[test]
    fn test_rebuild_index_after_db_loss() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            store.write("alpha", StatePatch::new().loop_count(1)).unwrap();
            store.write("alpha", StatePatch::new().loop_count(2)).unwrap();
            store.write("beta", StatePatch::new()).unwrap();
        }

        let db_path = temp_dir.path().join(".taskstore/taskstore.db");
        fs::remove_file(&db_path).unwrap();

        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            assert_eq!(store.list_projects().unwrap().len(), 2);
            // Last snapshot wins
            assert_eq!(store.read("alpha").unwrap().loop_count, 2);
        }
    }

    #[test]
    fn test_torn_log_line_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            store.write("alpha", StatePatch::new().loop_count(5)).unwrap();
            let mut file = OpenOptions::new().append(true).open(store.log_path()).unwrap();
            write!(file, "{{\"project_id\":\"alp").unwrap();
        }

        fs::remove_file(temp_dir.path().join(".taskstore/taskstore.db")).unwrap();
        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        assert_eq!(store.read("alpha").unwrap().loop_count, 5);
    }

    #[test]
    fn test_log_ahead_of_index_is_replayed() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            store.write("alpha", StatePatch::new().loop_count(1)).unwrap();

            // Snapshot logged but never indexed, as after a crash between the two
            let mut newer = store.read("alpha").unwrap();
            newer.loop_count = 2;
            let mut file = OpenOptions::new().append(true).open(store.log_path()).unwrap();
            writeln!(file, "{}", serde_json::to_string(&newer).unwrap()).unwrap();
        }

        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        assert_eq!(store.read("alpha").unwrap().loop_count, 2);

        store.write("alpha", StatePatch::new().files(vec!["a".into()])).unwrap();
        let state = store.read("alpha").unwrap();
        assert_eq!(state.loop_count, 2);
        assert_eq!(state.files_created, vec!["a"]);
    }

    #[test]
    fn test_reopen_without_drift_keeps_log() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            store.write("alpha", StatePatch::new()).unwrap();
            store.write("alpha", StatePatch::new().loop_count(1)).unwrap();
        }

        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        let lines = fs::read_to_string(store.log_path()).unwrap().lines().count();
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_long_log_is_compacted_on_open() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = TaskStore::open_at(temp_dir.path()).unwrap();
            for i in 0..(COMPACT_RATIO * 2 + 1) {
                store.write("alpha", StatePatch::new().files(vec![format!("f{}", i)])).unwrap();
            }
            store.write("beta", StatePatch::new()).unwrap();
        }

        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        let log = fs::read_to_string(store.log_path()).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert_eq!(store.read("alpha").unwrap().files_created.len(), COMPACT_RATIO * 2 + 1);

        // Appends continue from the compacted log without a spurious rebuild
        store.write("beta", StatePatch::new().loop_count(1)).unwrap();
        drop(store);
        let store = TaskStore::open_at(temp_dir.path()).unwrap();
        assert_eq!(fs::read_to_string(store.log_path()).unwrap().lines().count(), 3);
        assert_eq!(store.read("beta").unwrap().loop_count, 1);
    }

    #[test]
    fn test_concurrent_appends_same_project() {
        let (store, _temp) = create_temp_store();
        std::thread::scope(|s| {
            for t in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..10 {
                        store
                            .write("shared", StatePatch::new().files(vec![format!("{}-{}", t, i)]))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(store.read("shared").unwrap().files_created.len(), 40);
    }

    #[test]
    fn test_compute_project_hash() {
        let temp_dir = TempDir::new().unwrap();
        let hash = compute_project_hash(temp_dir.path()).unwrap();

        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        let hash2 = compute_project_hash(temp_dir.path()).unwrap();
        assert_eq!(hash, hash2);
    }
}
