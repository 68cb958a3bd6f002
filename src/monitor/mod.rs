//! Execution Monitor.
//!
//! Tracks each agent run as a small state machine over the project's
//! append-only execution log:
//!
//! ```text
//! not_started --start--> running --complete--> completed
//!                           |
//!                           +-- (check sees now - start > timeout) --> frozen
//! ```
//!
//! Frozen is detected lazily. There is no timer: a run is only reported
//! frozen when a caller invokes `check_frozen`, so detection latency equals
//! the caller's polling interval. Detection appends an alert and leaves the
//! run's records untouched; `reset` is the only way back to `not_started`.

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::AgentRegistry;
use crate::error::{LoopError, Result};
use crate::store::{
    ExecutionRecord, ExecutionStatus, FeedbackEntry, FeedbackKind, FrozenAlert, ProjectState, StatePatch, StateStore,
    WorkerStatus, now_ms,
};

/// Acknowledgement for a start signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartAck {
    Started { loop_iteration: u64, start_time: i64 },
    /// A run is already in progress; nothing was recorded.
    AlreadyRunning { loop_iteration: u64, since: i64 },
}

/// Acknowledgement for a completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompleteAck {
    Completed { loop_iteration: u64, duration_ms: i64 },
    /// No running record to complete; the signal was noted and ignored.
    NotRunning,
}

/// One frozen agent as reported by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenReport {
    pub agent_id: String,
    pub duration_ms: i64,
    pub timeout_seconds: u64,
    pub loop_iteration: u64,
}

/// Start/complete/check/reset over the project store.
pub struct ExecutionMonitor {
    store: Arc<dyn StateStore>,
    registry: AgentRegistry,
}

impl ExecutionMonitor {
    pub fn new(store: Arc<dyn StateStore>, registry: AgentRegistry) -> Self {
        Self { store, registry }
    }

    /// Record a start signal using the wall clock.
    pub fn start(&self, project_id: &str, agent_id: &str) -> Result<StartAck> {
        self.start_at(project_id, agent_id, now_ms())
    }

    /// Record a start signal at `now`.
    pub fn start_at(&self, project_id: &str, agent_id: &str, now: i64) -> Result<StartAck> {
        let mut ack = None;
        self.store.apply(project_id, &mut |state| {
            if let Some(latest) = state.latest_record(agent_id)
                && latest.status == ExecutionStatus::Running
            {
                ack = Some(StartAck::AlreadyRunning {
                    loop_iteration: latest.loop_iteration,
                    since: latest.start_time,
                });
                return StatePatch::new();
            }

            ack = Some(StartAck::Started {
                loop_iteration: state.loop_count,
                start_time: now,
            });
            StatePatch::new().execution_record(ExecutionRecord::running(agent_id, state.loop_count, now))
        })?;

        let ack = ack.unwrap_or(StartAck::Started {
            loop_iteration: 0,
            start_time: now,
        });
        match &ack {
            StartAck::Started { loop_iteration, .. } => {
                info!("Started {} for {} (loop {})", agent_id, project_id, loop_iteration)
            }
            StartAck::AlreadyRunning { since, .. } => {
                warn!("{} already running for {} since {}", agent_id, project_id, since)
            }
        }
        Ok(ack)
    }

    /// Record a completion signal using the wall clock.
    pub fn complete(&self, project_id: &str, agent_id: &str, status: WorkerStatus) -> Result<CompleteAck> {
        self.complete_at(project_id, agent_id, status, now_ms())
    }

    /// Record a completion signal at `now`.
    pub fn complete_at(
        &self,
        project_id: &str,
        agent_id: &str,
        status: WorkerStatus,
        now: i64,
    ) -> Result<CompleteAck> {
        match self.store.read(project_id) {
            Err(LoopError::NotFound(_)) => {
                warn!("Completion for {} on unknown project {}", agent_id, project_id);
                return Ok(CompleteAck::NotRunning);
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        let mut ack = CompleteAck::NotRunning;
        self.store.apply(project_id, &mut |state| match state.latest_record(agent_id) {
            Some(latest) if latest.status == ExecutionStatus::Running => {
                let done = latest.completed_from(now, status);
                ack = CompleteAck::Completed {
                    loop_iteration: done.loop_iteration,
                    duration_ms: done.duration_ms().unwrap_or(0),
                };
                StatePatch::new().execution_record(done)
            }
            _ => {
                ack = CompleteAck::NotRunning;
                StatePatch::new().feedback(
                    FeedbackEntry::new(
                        FeedbackKind::Note,
                        state.loop_count,
                        format!("completion ({}) received with no running record", status),
                    )
                    .for_agent(agent_id),
                )
            }
        })?;

        if ack == CompleteAck::NotRunning {
            warn!("Ignored completion for {} on {}: not running", agent_id, project_id);
        }
        Ok(ack)
    }

    /// Report agents whose latest run is overdue, using the wall clock.
    pub fn check_frozen(&self, project_id: &str) -> Result<Vec<FrozenReport>> {
        self.check_frozen_at(project_id, now_ms())
    }

    /// Report agents whose latest run is `running` with `now - start > timeout`,
    /// appending an alert for each stall not already recorded.
    pub fn check_frozen_at(&self, project_id: &str, now: i64) -> Result<Vec<FrozenReport>> {
        let state = self.store.read(project_id)?;
        if self.frozen_records(&state, now).is_empty() {
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        self.store.apply(project_id, &mut |state| {
            reports.clear();
            let mut patch = StatePatch::new();
            for record in self.frozen_records(state, now) {
                let timeout_seconds = self.registry.timeout_for(&record.agent_id);
                let alert = FrozenAlert {
                    agent_id: record.agent_id.clone(),
                    start_time: record.start_time,
                    duration_ms: record.elapsed_ms(now),
                    timeout_seconds,
                    loop_iteration: record.loop_iteration,
                    detected_at: now,
                };

                let first_detection = !state.frozen_agents.iter().any(|a| a.same_stall(&alert));
                if first_detection {
                    patch = patch.feedback(
                        FeedbackEntry::new(
                            FeedbackKind::Frozen,
                            record.loop_iteration,
                            format!(
                                "running for {}ms, timeout {}s",
                                alert.duration_ms, timeout_seconds
                            ),
                        )
                        .for_agent(&record.agent_id),
                    );
                    patch = patch.frozen_alert(alert.clone());
                }

                reports.push(FrozenReport {
                    agent_id: alert.agent_id,
                    duration_ms: alert.duration_ms,
                    timeout_seconds,
                    loop_iteration: alert.loop_iteration,
                });
            }
            patch
        })?;

        for report in &reports {
            warn!(
                "Agent {} frozen on {}: {}ms > {}s",
                report.agent_id, project_id, report.duration_ms, report.timeout_seconds
            );
        }
        Ok(reports)
    }

    fn frozen_records<'a>(&self, state: &'a ProjectState, now: i64) -> Vec<&'a ExecutionRecord> {
        state
            .running_agents()
            .into_iter()
            .filter(|r| self.is_overdue(r, now))
            .collect()
    }

    fn is_overdue(&self, record: &ExecutionRecord, now: i64) -> bool {
        let timeout_ms = i64::try_from(self.registry.timeout_for(&record.agent_id))
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        record.elapsed_ms(now) > timeout_ms
    }

    /// Derived status of an agent's latest run as of `now`.
    pub fn status(&self, state: &ProjectState, agent_id: &str, now: i64) -> ExecutionStatus {
        match state.latest_record(agent_id) {
            None => ExecutionStatus::NotStarted,
            Some(r) if r.status == ExecutionStatus::Running && self.is_overdue(r, now) => ExecutionStatus::Frozen,
            Some(r) => r.status,
        }
    }

    /// Move running or frozen runs back to `not_started`.
    ///
    /// With `agent_id`, only that agent is considered. Appends a marker
    /// record per reset run and returns how many were reset; calling it
    /// again immediately returns 0. Unknown projects reset nothing.
    pub fn reset(&self, project_id: &str, agent_id: Option<&str>) -> Result<usize> {
        match self.store.read(project_id) {
            Err(LoopError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
            Ok(state) if state.running_agents().is_empty() => return Ok(0),
            Ok(_) => {}
        }

        let now = now_ms();
        let mut count = 0;
        self.store.apply(project_id, &mut |state| {
            let mut patch = StatePatch::new();
            count = 0;
            for record in state.running_agents() {
                if agent_id.is_some_and(|a| a != record.agent_id) {
                    continue;
                }
                patch = patch.execution_record(record.reset_from(now));
                count += 1;
            }
            if count > 0 {
                patch = patch.feedback(FeedbackEntry::new(
                    FeedbackKind::Note,
                    state.loop_count,
                    format!("reset {} run(s){}", count, agent_id.map(|a| format!(" of {}", a)).unwrap_or_default()),
                ));
            }
            patch
        })?;

        if count > 0 {
            info!("Reset {} run(s) on {}", count, project_id);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentSpec;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn monitor() -> (ExecutionMonitor, Arc<MemoryStore>) {
        let mut agents = BTreeMap::new();
        agents.insert("nova".to_string(), AgentSpec::new("builder", 10));
        agents.insert("iris".to_string(), AgentSpec::new("ui", 60));
        let store = Arc::new(MemoryStore::new());
        let monitor = ExecutionMonitor::new(store.clone(), AgentRegistry::new(agents, 30));
        (monitor, store)
    }

    #[test]
    fn test_start_records_running() {
        let (monitor, store) = monitor();
        let ack = monitor.start_at("p", "nova", 1_000).unwrap();
        assert_eq!(
            ack,
            StartAck::Started {
                loop_iteration: 0,
                start_time: 1_000
            }
        );

        let state = store.read("p").unwrap();
        let latest = state.latest_record("nova").unwrap();
        assert_eq!(latest.status, ExecutionStatus::Running);
        assert_eq!(latest.start_time, 1_000);
    }

    #[test]
    fn test_start_twice_keeps_single_running() {
        let (monitor, store) = monitor();
        monitor.start_at("p", "nova", 1_000).unwrap();
        let ack = monitor.start_at("p", "nova", 2_000).unwrap();
        assert_eq!(
            ack,
            StartAck::AlreadyRunning {
                loop_iteration: 0,
                since: 1_000
            }
        );
        assert_eq!(store.read("p").unwrap().execution_log["nova"].len(), 1);
    }

    #[test]
    fn test_complete_derives_duration() {
        let (monitor, store) = monitor();
        monitor.start_at("p", "nova", 1_000).unwrap();
        let ack = monitor
            .complete_at("p", "nova", WorkerStatus::Success, 4_500)
            .unwrap();
        assert_eq!(
            ack,
            CompleteAck::Completed {
                loop_iteration: 0,
                duration_ms: 3_500
            }
        );

        let state = store.read("p").unwrap();
        let history = &state.execution_log["nova"];
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ExecutionStatus::Running);
        assert_eq!(history[1].status, ExecutionStatus::Completed);
        assert_eq!(history[1].duration_ms(), Some(3_500));
    }

    #[test]
    fn test_complete_without_start_is_noted() {
        let (monitor, store) = monitor();
        monitor.start_at("p", "iris", 0).unwrap();
        let ack = monitor.complete_at("p", "nova", WorkerStatus::Success, 10).unwrap();
        assert_eq!(ack, CompleteAck::NotRunning);

        let state = store.read("p").unwrap();
        assert!(state.latest_record("nova").is_none());
        assert_eq!(state.feedback_log.last().unwrap().kind, FeedbackKind::Note);
    }

    #[test]
    fn test_complete_unknown_project() {
        let (monitor, store) = monitor();
        let ack = monitor.complete_at("ghost", "nova", WorkerStatus::Success, 10).unwrap();
        assert_eq!(ack, CompleteAck::NotRunning);
        assert!(store.read("ghost").is_err());
    }

    #[test]
    fn test_check_frozen_strictly_after_timeout() {
        let (monitor, _store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();

        // nova timeout is 10s
        assert!(monitor.check_frozen_at("p", 10_000).unwrap().is_empty());
        let frozen = monitor.check_frozen_at("p", 10_001).unwrap();
        assert_eq!(
            frozen,
            vec![FrozenReport {
                agent_id: "nova".into(),
                duration_ms: 10_001,
                timeout_seconds: 10,
                loop_iteration: 0
            }]
        );
    }

    #[test]
    fn test_check_frozen_ignores_completed() {
        let (monitor, _store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();
        monitor.complete_at("p", "nova", WorkerStatus::Success, 5_000).unwrap();
        assert!(monitor.check_frozen_at("p", 1_000_000).unwrap().is_empty());
    }

    #[test]
    fn test_check_frozen_alert_not_duplicated() {
        let (monitor, store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();
        monitor.check_frozen_at("p", 20_000).unwrap();
        let again = monitor.check_frozen_at("p", 30_000).unwrap();

        // Still reported, alert recorded once
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].duration_ms, 30_000);
        let state = store.read("p").unwrap();
        assert_eq!(state.frozen_agents.len(), 1);
        // Record status is never rewritten
        assert_eq!(state.latest_record("nova").unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_check_frozen_unknown_project() {
        let (monitor, _store) = monitor();
        assert!(matches!(
            monitor.check_frozen_at("ghost", 0),
            Err(LoopError::NotFound(_))
        ));
    }

    #[test]
    fn test_status_derivation() {
        let (monitor, store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();
        let state = store.read("p").unwrap();
        assert_eq!(monitor.status(&state, "nova", 5_000), ExecutionStatus::Running);
        assert_eq!(monitor.status(&state, "nova", 50_000), ExecutionStatus::Frozen);
        assert_eq!(monitor.status(&state, "iris", 0), ExecutionStatus::NotStarted);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (monitor, store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();
        monitor.check_frozen_at("p", 60_000).unwrap();

        assert_eq!(monitor.reset("p", Some("nova")).unwrap(), 1);
        assert_eq!(monitor.reset("p", Some("nova")).unwrap(), 0);

        let state = store.read("p").unwrap();
        let history = &state.execution_log["nova"];
        // History retained
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, ExecutionStatus::NotStarted);
        assert!(monitor.check_frozen_at("p", 120_000).unwrap().is_empty());
    }

    #[test]
    fn test_reset_filters_by_agent() {
        let (monitor, _store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();
        monitor.start_at("p", "iris", 0).unwrap();

        assert_eq!(monitor.reset("p", Some("iris")).unwrap(), 1);
        assert_eq!(monitor.reset("p", None).unwrap(), 1);
        assert_eq!(monitor.reset("p", None).unwrap(), 0);
    }

    #[test]
    fn test_reset_unknown_project_is_zero() {
        let (monitor, _store) = monitor();
        assert_eq!(monitor.reset("ghost", None).unwrap(), 0);
    }

    #[test]
    fn test_restart_after_reset() {
        let (monitor, _store) = monitor();
        monitor.start_at("p", "nova", 0).unwrap();
        monitor.reset("p", None).unwrap();
        assert!(matches!(
            monitor.start_at("p", "nova", 100).unwrap(),
            StartAck::Started { .. }
        ));
    }

    #[test]
    fn test_unknown_agent_uses_default_timeout() {
        let (monitor, _store) = monitor();
        monitor.start_at("p", "ghost", 0).unwrap();
        assert!(monitor.check_frozen_at("p", 30_000).unwrap().is_empty());
        assert_eq!(monitor.check_frozen_at("p", 30_001).unwrap().len(), 1);
    }

    #[test]
    fn test_huge_timeouts_never_freeze() {
        let mut agents = BTreeMap::new();
        agents.insert("slow".to_string(), AgentSpec::new("builder", u64::MAX / 2));
        agents.insert("slower".to_string(), AgentSpec::new("builder", u64::MAX));
        let store = Arc::new(MemoryStore::new());
        let monitor = ExecutionMonitor::new(store.clone(), AgentRegistry::new(agents, 30));

        monitor.start_at("p", "slow", 0).unwrap();
        monitor.start_at("p", "slower", 0).unwrap();

        assert!(monitor.check_frozen_at("p", i64::MAX).unwrap().is_empty());
        let state = store.read("p").unwrap();
        assert_eq!(monitor.status(&state, "slower", i64::MAX), ExecutionStatus::Running);
    }
}
