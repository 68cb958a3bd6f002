//! Record types persisted per project.
//!
//! `ProjectState` is the single durable record for a project id. Histories
//! inside it (`execution_log`, `reflection_scores`, `feedback_log`) are
//! append-only: components read the latest entry and append new ones, they
//! never rewrite past entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// The per-project execution state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectState {
    pub project_id: String,

    /// Incremented once per completed (non-blocked, non-rerun) step
    pub loop_count: u64,

    /// Agent ids in first-completion order, unique
    pub completed_steps: Vec<String>,

    pub last_completed_agent: Option<String>,

    /// Agents whose step has completed at least once
    pub agents_involved: BTreeSet<String>,

    /// Free text hint produced by the last completed worker
    pub next_recommended_step: Option<String>,

    pub files_created: Vec<String>,

    /// agent id -> ordered execution history
    pub execution_log: BTreeMap<String, Vec<ExecutionRecord>>,

    /// Alerts raised by frozen-worker checks, unique per (agent, start_time)
    pub frozen_agents: Vec<FrozenAlert>,

    pub reflection_scores: Vec<ReflectionScore>,

    /// Subset of `reflection_scores` with `weak == true`
    pub weak_reflections: Vec<ReflectionScore>,

    pub feedback_log: Vec<FeedbackEntry>,

    /// Task text sent with the current invocation
    pub current_task: Option<String>,

    /// Raw reflection payload awaiting grading
    pub pending_reflection: Option<serde_json::Value>,

    /// Worker outcome staged until the step proceeds
    pub pending_result: Option<StagedResult>,

    /// "<agent>@<loop>" -> reruns requested in that iteration chain
    pub rerun_counts: BTreeMap<String, u32>,

    pub driver: DriverState,

    /// Unix timestamp in milliseconds
    pub created_at: i64,

    /// Unix timestamp in milliseconds
    pub updated_at: i64,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self::new("")
    }
}

impl ProjectState {
    /// Create an empty state for a project id.
    pub fn new(project_id: &str) -> Self {
        let now = now_ms();
        Self {
            project_id: project_id.to_string(),
            loop_count: 0,
            completed_steps: Vec::new(),
            last_completed_agent: None,
            agents_involved: BTreeSet::new(),
            next_recommended_step: None,
            files_created: Vec::new(),
            execution_log: BTreeMap::new(),
            frozen_agents: Vec::new(),
            reflection_scores: Vec::new(),
            weak_reflections: Vec::new(),
            feedback_log: Vec::new(),
            current_task: None,
            pending_reflection: None,
            pending_result: None,
            rerun_counts: BTreeMap::new(),
            driver: DriverState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Latest execution record for an agent, if any.
    pub fn latest_record(&self, agent_id: &str) -> Option<&ExecutionRecord> {
        self.execution_log.get(agent_id).and_then(|records| records.last())
    }

    /// Agents whose latest record is `running`.
    pub fn running_agents(&self) -> Vec<&ExecutionRecord> {
        self.execution_log
            .values()
            .filter_map(|records| records.last())
            .filter(|r| r.status == ExecutionStatus::Running)
            .collect()
    }

    /// Most recent reflection score.
    pub fn latest_score(&self) -> Option<&ReflectionScore> {
        self.reflection_scores.last()
    }

    /// Most recent reflection score attributed to `agent_id`.
    pub fn latest_score_for(&self, agent_id: &str) -> Option<&ReflectionScore> {
        self.reflection_scores
            .iter()
            .rev()
            .find(|s| s.agent_id.as_deref() == Some(agent_id))
    }

    /// Reruns already requested for an agent in the current iteration chain.
    pub fn rerun_count(&self, agent_id: &str, loop_iteration: u64) -> u32 {
        self.rerun_counts
            .get(&rerun_key(agent_id, loop_iteration))
            .copied()
            .unwrap_or(0)
    }

    /// Update the timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Key for the rerun counter of an (agent, iteration chain) pair.
pub fn rerun_key(agent_id: &str, loop_iteration: u64) -> String {
    format!("{}@{}", agent_id, loop_iteration)
}

/// Execution status of a single record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Marker appended by reset
    NotStarted,
    Running,
    Completed,
    /// Running past its deadline; derived by checks, never written over a record
    Frozen,
}

impl ExecutionStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::NotStarted => "not_started",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Frozen => "frozen",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome status reported by a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Success,
    Error,
    Blocked,
}

impl WorkerStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Success => "success",
            WorkerStatus::Error => "error",
            WorkerStatus::Blocked => "blocked",
        }
    }

    /// Lenient parse; unknown text is treated as an error outcome.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" | "ok" | "done" | "completed" => WorkerStatus::Success,
            "blocked" => WorkerStatus::Blocked,
            _ => WorkerStatus::Error,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One start/complete/reset event in an agent's execution history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub agent_id: String,

    /// Unix timestamp in milliseconds
    pub start_time: i64,

    /// Unix timestamp in milliseconds
    pub end_time: Option<i64>,

    pub status: ExecutionStatus,

    /// Project loop_count when the run started
    pub loop_iteration: u64,

    /// Status reported on completion
    #[serde(default)]
    pub outcome: Option<WorkerStatus>,
}

impl ExecutionRecord {
    /// A freshly started run.
    pub fn running(agent_id: &str, loop_iteration: u64, start_time: i64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            start_time,
            end_time: None,
            status: ExecutionStatus::Running,
            loop_iteration,
            outcome: None,
        }
    }

    /// Completion entry for a running record.
    pub fn completed_from(&self, end_time: i64, outcome: WorkerStatus) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            start_time: self.start_time,
            end_time: Some(end_time),
            status: ExecutionStatus::Completed,
            loop_iteration: self.loop_iteration,
            outcome: Some(outcome),
        }
    }

    /// Reset marker for a running record.
    pub fn reset_from(&self, at: i64) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            start_time: self.start_time,
            end_time: Some(at),
            status: ExecutionStatus::NotStarted,
            loop_iteration: self.loop_iteration,
            outcome: None,
        }
    }

    /// Derived run duration in milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| (end - self.start_time).max(0))
    }

    /// Time since start as observed at `now`.
    pub fn elapsed_ms(&self, now: i64) -> i64 {
        now.saturating_sub(self.start_time).max(0)
    }
}

/// Alert raised when a running agent exceeds its timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrozenAlert {
    pub agent_id: String,
    pub start_time: i64,
    pub duration_ms: i64,
    pub timeout_seconds: u64,
    pub loop_iteration: u64,
    pub detected_at: i64,
}

impl FrozenAlert {
    /// Two alerts describe the same stall when agent and start time match.
    pub fn same_stall(&self, other: &FrozenAlert) -> bool {
        self.agent_id == other.agent_id && self.start_time == other.start_time
    }
}

/// Graded reflection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReflectionScore {
    pub reflection_id: String,
    pub agent_id: Option<String>,
    pub score: f64,
    pub issues: Vec<String>,
    pub weak: bool,
    pub loop_iteration: u64,

    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Category of a feedback entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Blocked,
    Frozen,
    Rerun,
    RerunCap,
    Signal,
    WorkerError,
    WorkerBlocked,
    Note,
}

impl FeedbackKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Blocked => "blocked",
            FeedbackKind::Frozen => "frozen",
            FeedbackKind::Rerun => "rerun",
            FeedbackKind::RerunCap => "rerun_cap",
            FeedbackKind::Signal => "signal",
            FeedbackKind::WorkerError => "worker_error",
            FeedbackKind::WorkerBlocked => "worker_blocked",
            FeedbackKind::Note => "note",
        }
    }
}

impl std::fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Soft alert, warning or note recorded for observability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackEntry {
    pub kind: FeedbackKind,
    pub agent_id: Option<String>,
    pub loop_iteration: u64,
    pub message: String,

    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl FeedbackEntry {
    pub fn new(kind: FeedbackKind, loop_iteration: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            agent_id: None,
            loop_iteration,
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Worker outcome held back until the step proceeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagedResult {
    pub agent_id: String,
    pub status: WorkerStatus,
    pub files_created: Vec<String>,
    pub next_recommended_step: Option<String>,
}

/// Phases of the loop driver state machine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DriverPhase {
    #[default]
    Idle,
    Selecting,
    Invoking,
    AwaitingCompletion,
    Grading,
    Deciding,
    Terminal,
}

impl DriverPhase {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverPhase::Idle => "idle",
            DriverPhase::Selecting => "selecting",
            DriverPhase::Invoking => "invoking",
            DriverPhase::AwaitingCompletion => "awaiting_completion",
            DriverPhase::Grading => "grading",
            DriverPhase::Deciding => "deciding",
            DriverPhase::Terminal => "terminal",
        }
    }

    /// Terminal is absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverPhase::Terminal)
    }
}

impl std::fmt::Display for DriverPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted driver position for a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverState {
    pub phase: DriverPhase,

    /// Agent being invoked or awaited
    pub active_agent: Option<String>,

    /// Task text to resend on rerun
    pub active_task: Option<String>,
}

/// Generate a unique reflection ID based on timestamp with sub-second precision.
///
/// Format: "refl-" + seconds + microseconds + counter suffix
pub fn generate_reflection_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();

    let secs = duration.as_secs();
    let micros = duration.subsec_micros();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("refl-{}{:06}{:04}", secs, micros, counter % 10000)
}

/// Get current time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = ProjectState::new("alpha");
        assert_eq!(state.project_id, "alpha");
        assert_eq!(state.loop_count, 0);
        assert!(state.execution_log.is_empty());
        assert_eq!(state.driver.phase, DriverPhase::Idle);
    }

    #[test]
    fn test_latest_record_and_running_agents() {
        let mut state = ProjectState::new("alpha");
        let started = ExecutionRecord::running("nova", 0, 1_000);
        let done = started.completed_from(4_000, WorkerStatus::Success);
        state
            .execution_log
            .insert("nova".into(), vec![started.clone(), done.clone()]);
        state
            .execution_log
            .insert("iris".into(), vec![ExecutionRecord::running("iris", 0, 2_000)]);

        assert_eq!(state.latest_record("nova"), Some(&done));
        let running = state.running_agents();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].agent_id, "iris");
    }

    #[test]
    fn test_duration_derived_from_end_time() {
        let started = ExecutionRecord::running("nova", 3, 1_000);
        assert_eq!(started.duration_ms(), None);
        assert_eq!(started.elapsed_ms(2_500), 1_500);

        let done = started.completed_from(4_000, WorkerStatus::Success);
        assert_eq!(done.duration_ms(), Some(3_000));
        assert_eq!(done.loop_iteration, 3);
        assert_eq!(done.outcome, Some(WorkerStatus::Success));
    }

    #[test]
    fn test_reset_marker_keeps_start_time() {
        let started = ExecutionRecord::running("nova", 1, 1_000);
        let reset = started.reset_from(9_000);
        assert_eq!(reset.status, ExecutionStatus::NotStarted);
        assert_eq!(reset.start_time, 1_000);
        assert_eq!(reset.end_time, Some(9_000));
    }

    #[test]
    fn test_worker_status_parse_lenient() {
        assert_eq!(WorkerStatus::parse_lenient("SUCCESS"), WorkerStatus::Success);
        assert_eq!(WorkerStatus::parse_lenient(" blocked "), WorkerStatus::Blocked);
        assert_eq!(WorkerStatus::parse_lenient("exploded"), WorkerStatus::Error);
    }

    #[test]
    fn test_rerun_count_defaults_to_zero() {
        let mut state = ProjectState::new("alpha");
        assert_eq!(state.rerun_count("nova", 2), 0);
        state.rerun_counts.insert(rerun_key("nova", 2), 1);
        assert_eq!(state.rerun_count("nova", 2), 1);
        assert_eq!(state.rerun_count("nova", 3), 0);
    }

    #[test]
    fn test_frozen_alert_same_stall() {
        let a = FrozenAlert {
            agent_id: "nova".into(),
            start_time: 10,
            duration_ms: 5,
            timeout_seconds: 1,
            loop_iteration: 0,
            detected_at: 15,
        };
        let mut b = a.clone();
        b.detected_at = 99;
        b.duration_ms = 89;
        assert!(a.same_stall(&b));
        b.start_time = 11;
        assert!(!a.same_stall(&b));
    }

    #[test]
    fn test_state_deserializes_with_missing_fields() {
        let state: ProjectState = serde_json::from_str(r#"{"project_id":"p","loop_count":4}"#).unwrap();
        assert_eq!(state.loop_count, 4);
        assert!(state.reflection_scores.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::NotStarted).unwrap(),
            "\"not_started\""
        );
        assert_eq!(
            serde_json::to_string(&DriverPhase::AwaitingCompletion).unwrap(),
            "\"awaiting_completion\""
        );
    }

    #[test]
    fn test_generate_reflection_id_uniqueness() {
        let ids: Vec<String> = (0..100).map(|_| generate_reflection_id()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len(), "IDs should be unique");
        assert!(ids[0].starts_with("refl-"));
    }
}
