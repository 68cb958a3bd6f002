//! The loop driver state machine.
//!
//! ```text
//! Idle -> Selecting -> Invoking -> AwaitingCompletion -> Grading -> Deciding
//!            |  |                        |                            |  |
//!            |  +-> Idle (blocked)       +-> Idle (frozen)            |  +-> Invoking (rerun)
//!            +----> Terminal                                          +----> Selecting (proceed)
//! ```
//!
//! The phase is persisted with the project so a tick can resume where the
//! previous one stopped. Terminal is absorbing.
//!
//! Ticks and delivered completions on one project are serialised within a
//! driver. Across processes, only the call whose `start` wins owns the
//! driver state; a call that loses reports `Busy` and leaves it alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::driver::invoker::{Dispatch, WorkerInvoker, WorkerResult};
use crate::error::{LoopError, Result};
use crate::grader::{Grade, ReflectionGrader};
use crate::monitor::{CompleteAck, ExecutionMonitor, FrozenReport, StartAck};
use crate::rerun::{Decision, QualitySignals, RerunEngine};
use crate::selector::{Selection, StepSelector};
use crate::store::{
    DriverPhase, DriverState, ExecutionStatus, FeedbackEntry, FeedbackKind, ProjectState, StatePatch, StateStore,
    WorkerStatus, now_ms,
};

/// What a tick (or a delivered completion) ended with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing left to run
    Terminal,
    /// The selected agent waits on a dependency
    Blocked { agent_id: String, missing: String },
    /// The selected agent still has a run in progress
    Busy { agent_id: String },
    /// Dispatched; completion has not arrived yet
    AwaitingCompletion { agent_id: String },
    /// The awaited agent overran its timeout
    Frozen {
        agent_id: String,
        duration_ms: i64,
        timeout_seconds: u64,
    },
    /// The worker reported it could not make progress
    WorkerBlocked { agent_id: String },
    /// The awaited run was reset before it completed
    Cancelled { agent_id: String },
    /// A completion arrived for an agent the driver was not waiting on
    NotAwaiting { agent_id: String },
    /// The step was accepted and the loop advanced
    Proceeded {
        agent_id: String,
        loop_count: u64,
        score: Option<f64>,
        capped: bool,
    },
}

/// Result of one `tick` or `complete_with_result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub project_id: String,
    pub outcome: TickOutcome,

    /// Persisted phase after the call
    pub phase: DriverPhase,

    /// Reruns performed during the call
    pub reruns: u32,
}

enum Invoked {
    Busy,
    Awaiting,
    Finished(WorkerResult),
}

/// Sequences selection, invocation, grading and rerun decisions per project.
pub struct LoopDriver {
    store: Arc<dyn StateStore>,
    selector: StepSelector,
    monitor: ExecutionMonitor,
    grader: ReflectionGrader,
    rerun: RerunEngine,
    invoker: Arc<dyn WorkerInvoker>,

    /// One lock per project id, held for a whole tick or completion
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LoopDriver {
    /// Wire the components over one store handle.
    pub fn new(config: &Config, store: Arc<dyn StateStore>, invoker: Arc<dyn WorkerInvoker>) -> Self {
        Self {
            selector: StepSelector::from_config(config),
            monitor: ExecutionMonitor::new(store.clone(), config.registry()),
            grader: ReflectionGrader::new(store.clone(), config.grader.clone()),
            rerun: RerunEngine::new(store.clone(), config.rerun.clone()),
            store,
            invoker,
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Validate `config` before wiring.
    pub fn from_config(config: &Config, store: Arc<dyn StateStore>, invoker: Arc<dyn WorkerInvoker>) -> Result<Self> {
        config.validate().map_err(|e| LoopError::Config(e.to_string()))?;
        Ok(Self::new(config, store, invoker))
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// Current state of a project.
    pub fn state(&self, project_id: &str) -> Result<ProjectState> {
        self.store.read(project_id)
    }

    /// Which agent would run next. An unseen project selects from an empty state.
    pub fn select_next(&self, project_id: &str) -> Result<Selection> {
        let state = self.store.read_or_new(project_id)?;
        Ok(self.selector.select(&state))
    }

    pub fn start(&self, project_id: &str, agent_id: &str) -> Result<StartAck> {
        self.monitor.start(project_id, agent_id)
    }

    pub fn complete(&self, project_id: &str, agent_id: &str, status: WorkerStatus) -> Result<CompleteAck> {
        self.monitor.complete(project_id, agent_id, status)
    }

    pub fn check_frozen(&self, project_id: &str) -> Result<Vec<FrozenReport>> {
        self.monitor.check_frozen(project_id)
    }

    /// Reset running or frozen runs and release the driver if it was
    /// waiting on one of them.
    pub fn reset(&self, project_id: &str, agent_id: Option<&str>) -> Result<usize> {
        let count = self.monitor.reset(project_id, agent_id)?;
        if count == 0 {
            return Ok(0);
        }

        self.store.apply(project_id, &mut |state| {
            let waiting = matches!(
                state.driver.phase,
                DriverPhase::Invoking | DriverPhase::AwaitingCompletion
            );
            let released = state
                .driver
                .active_agent
                .as_deref()
                .is_some_and(|a| state.latest_record(a).is_none_or(|r| r.status != ExecutionStatus::Running));
            if waiting && released {
                StatePatch::new().driver(DriverState::default())
            } else {
                StatePatch::new()
            }
        })?;
        Ok(count)
    }

    pub fn grade(&self, project_id: &str) -> Result<Grade> {
        self.grader.grade(project_id)
    }

    pub fn decide(&self, project_id: &str, agent_id: &str, signals: &QualitySignals) -> Result<Decision> {
        self.rerun.evaluate(project_id, agent_id, signals)
    }

    /// Advance a project using the wall clock.
    pub fn tick(&self, project_id: &str, signals: &QualitySignals) -> Result<TickReport> {
        self.tick_at(project_id, signals, now_ms())
    }

    /// Advance a project until it must wait, reaches Terminal, or completes one step.
    pub fn tick_at(&self, project_id: &str, signals: &QualitySignals, now: i64) -> Result<TickReport> {
        let lock = self.project_lock(project_id)?;
        let _guard = lock.lock().map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;

        let state = self.store.read_or_new(project_id)?;
        let mut reruns = 0;

        debug!("Tick {} from {}", project_id, state.driver.phase);
        let outcome = match state.driver.phase {
            DriverPhase::Terminal => TickOutcome::Terminal,
            DriverPhase::Invoking | DriverPhase::AwaitingCompletion => {
                self.poll_active(project_id, &state, signals, now, &mut reruns)?
            }
            phase @ (DriverPhase::Grading | DriverPhase::Deciding) => match state.driver.active_agent.clone() {
                Some(agent) => {
                    let task = state.driver.active_task.clone().unwrap_or_default();
                    self.settle(project_id, &agent, &task, signals, phase, now, &mut reruns)?
                }
                None => self.select_and_run(project_id, &state, signals, now, &mut reruns)?,
            },
            DriverPhase::Idle | DriverPhase::Selecting => {
                self.select_and_run(project_id, &state, signals, now, &mut reruns)?
            }
        };

        self.report(project_id, outcome, reruns)
    }

    /// Deliver the raw result of an `Accepted` dispatch and carry the step
    /// through grading and the rerun decision.
    pub fn complete_with_result(
        &self,
        project_id: &str,
        agent_id: &str,
        raw: &Value,
        signals: &QualitySignals,
    ) -> Result<TickReport> {
        let lock = self.project_lock(project_id)?;
        let _guard = lock.lock().map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;

        let state = self.store.read(project_id)?;
        let result = WorkerResult::decode(raw);
        let now = now_ms();

        let awaiting = matches!(
            state.driver.phase,
            DriverPhase::Invoking | DriverPhase::AwaitingCompletion
        ) && state.driver.active_agent.as_deref() == Some(agent_id);
        if !awaiting {
            warn!("Completion for {} on {} was not awaited", agent_id, project_id);
            self.monitor.complete_at(project_id, agent_id, result.status, now)?;
            return self.report(
                project_id,
                TickOutcome::NotAwaiting {
                    agent_id: agent_id.to_string(),
                },
                0,
            );
        }

        let task = state.driver.active_task.clone().unwrap_or_default();
        if self.monitor.complete_at(project_id, agent_id, result.status, now)? == CompleteAck::NotRunning {
            self.release(project_id, agent_id)?;
            return self.report(
                project_id,
                TickOutcome::Cancelled {
                    agent_id: agent_id.to_string(),
                },
                0,
            );
        }

        let mut reruns = 0;
        let outcome = match self.stage_result(project_id, agent_id, &task, &result)? {
            Some(outcome) => outcome,
            None => self.settle(
                project_id,
                agent_id,
                &task,
                signals,
                DriverPhase::Grading,
                now,
                &mut reruns,
            )?,
        };
        self.report(project_id, outcome, reruns)
    }

    fn select_and_run(
        &self,
        project_id: &str,
        state: &ProjectState,
        signals: &QualitySignals,
        now: i64,
        reruns: &mut u32,
    ) -> Result<TickOutcome> {
        let selecting = DriverState {
            phase: DriverPhase::Selecting,
            ..Default::default()
        };
        if let Some(owner) = self.set_driver_if_free(project_id, None, selecting)? {
            info!("Project {} is already driving {}", project_id, owner);
            return Ok(TickOutcome::Busy { agent_id: owner });
        }

        let selection = self.selector.select(state);
        match &selection {
            Selection::Terminal => {
                info!("Project {} reached terminal state", project_id);
                let terminal = DriverState {
                    phase: DriverPhase::Terminal,
                    ..Default::default()
                };
                if let Some(owner) = self.set_driver_if_free(project_id, None, terminal)? {
                    return Ok(TickOutcome::Busy { agent_id: owner });
                }
                Ok(TickOutcome::Terminal)
            }
            Selection::Blocked { agent_id, missing } => {
                let reason = selection.blocked_reason().unwrap_or_default();
                warn!("Project {} blocked: {}", project_id, reason);
                self.idle_with_note(project_id, None, FeedbackKind::Blocked, agent_id, &reason)?;
                Ok(TickOutcome::Blocked {
                    agent_id: agent_id.clone(),
                    missing: missing.clone(),
                })
            }
            Selection::Agent { agent_id, .. } => {
                if state
                    .latest_record(agent_id)
                    .is_some_and(|r| r.status == ExecutionStatus::Running)
                {
                    return self.busy(project_id, agent_id);
                }
                let task = state
                    .next_recommended_step
                    .clone()
                    .unwrap_or_else(|| format!("Continue project {}", project_id));
                self.run_agent(project_id, agent_id, &task, signals, now, reruns)
            }
        }
    }

    fn run_agent(
        &self,
        project_id: &str,
        agent_id: &str,
        task: &str,
        signals: &QualitySignals,
        now: i64,
        reruns: &mut u32,
    ) -> Result<TickOutcome> {
        match self.invoke(project_id, agent_id, task, now)? {
            Invoked::Busy => self.busy(project_id, agent_id),
            Invoked::Awaiting => Ok(TickOutcome::AwaitingCompletion {
                agent_id: agent_id.to_string(),
            }),
            Invoked::Finished(result) => {
                self.monitor.complete_at(project_id, agent_id, result.status, now)?;
                match self.stage_result(project_id, agent_id, task, &result)? {
                    Some(outcome) => Ok(outcome),
                    None => self.settle(project_id, agent_id, task, signals, DriverPhase::Grading, now, reruns),
                }
            }
        }
    }

    fn invoke(&self, project_id: &str, agent_id: &str, task: &str, now: i64) -> Result<Invoked> {
        if let StartAck::AlreadyRunning { .. } = self.monitor.start_at(project_id, agent_id, now)? {
            return Ok(Invoked::Busy);
        }
        self.store.write(
            project_id,
            StatePatch::new()
                .current_task(Some(task.to_string()))
                .driver(active(DriverPhase::Invoking, agent_id, task)),
        )?;

        match self.invoker.invoke(agent_id, task, project_id) {
            Dispatch::Accepted => {
                self.set_driver(project_id, active(DriverPhase::AwaitingCompletion, agent_id, task))?;
                Ok(Invoked::Awaiting)
            }
            Dispatch::Finished(raw) => Ok(Invoked::Finished(WorkerResult::decode(&raw))),
        }
    }

    /// Stage a completed run for grading; a blocked worker ends the step here.
    fn stage_result(
        &self,
        project_id: &str,
        agent_id: &str,
        task: &str,
        result: &WorkerResult,
    ) -> Result<Option<TickOutcome>> {
        if result.status == WorkerStatus::Blocked {
            warn!("Worker {} reported blocked on {}", agent_id, project_id);
            self.idle_with_note(
                project_id,
                Some(agent_id),
                FeedbackKind::WorkerBlocked,
                agent_id,
                "worker reported blocked",
            )?;
            return Ok(Some(TickOutcome::WorkerBlocked {
                agent_id: agent_id.to_string(),
            }));
        }

        let staged = result.staged(agent_id);
        let reflection = result.reflection.clone();
        let is_error = result.status == WorkerStatus::Error;
        self.store.apply(project_id, &mut |state| {
            let mut patch = StatePatch::new()
                .pending_result(Some(staged.clone()))
                .driver(active(DriverPhase::Grading, agent_id, task));
            if let Some(reflection) = &reflection {
                patch = patch.pending_reflection(Some(reflection.clone()));
            }
            if is_error {
                patch = patch.feedback(
                    FeedbackEntry::new(FeedbackKind::WorkerError, state.loop_count, "worker reported error")
                        .for_agent(agent_id),
                );
            }
            patch
        })?;
        Ok(None)
    }

    /// Grade (when starting from Grading), decide, then rerun or proceed.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        project_id: &str,
        agent_id: &str,
        task: &str,
        signals: &QualitySignals,
        phase: DriverPhase,
        now: i64,
        reruns: &mut u32,
    ) -> Result<TickOutcome> {
        if phase == DriverPhase::Grading {
            self.grader.grade(project_id)?;
            self.set_driver(project_id, active(DriverPhase::Deciding, agent_id, task))?;
        }

        let decision = self.rerun.evaluate(project_id, agent_id, signals)?;
        if decision.is_rerun() {
            *reruns += 1;
            self.set_driver(project_id, active(DriverPhase::Invoking, agent_id, task))?;
            return self.run_agent(project_id, agent_id, task, signals, now, reruns);
        }
        self.proceed(project_id, agent_id, &decision)
    }

    fn proceed(&self, project_id: &str, agent_id: &str, decision: &Decision) -> Result<TickOutcome> {
        let mut outcome = None;
        self.store.apply(project_id, &mut |state| {
            let staged = state.pending_result.clone().filter(|s| s.agent_id == agent_id);
            let next_step = staged.as_ref().and_then(|s| s.next_recommended_step.clone());
            let files = staged.map(|s| s.files_created).unwrap_or_default();
            let loop_count = state.loop_count + 1;

            outcome = Some(TickOutcome::Proceeded {
                agent_id: agent_id.to_string(),
                loop_count,
                score: state.latest_score_for(agent_id).map(|s| s.score),
                capped: decision.capped,
            });

            StatePatch::new()
                .loop_count(loop_count)
                .completed_step(agent_id)
                .last_completed_agent(agent_id)
                .agent_involved(agent_id)
                .files(files)
                .next_recommended_step(next_step)
                .pending_result(None)
                .pending_reflection(None)
                .driver(DriverState {
                    phase: DriverPhase::Selecting,
                    ..Default::default()
                })
        })?;

        let outcome = outcome.unwrap_or(TickOutcome::Proceeded {
            agent_id: agent_id.to_string(),
            loop_count: 0,
            score: None,
            capped: decision.capped,
        });
        if let TickOutcome::Proceeded { loop_count, .. } = &outcome {
            info!("Project {} advanced to loop {} after {}", project_id, loop_count, agent_id);
        }
        Ok(outcome)
    }

    fn poll_active(
        &self,
        project_id: &str,
        state: &ProjectState,
        signals: &QualitySignals,
        now: i64,
        reruns: &mut u32,
    ) -> Result<TickOutcome> {
        let Some(agent_id) = state.driver.active_agent.clone() else {
            return self.select_and_run(project_id, state, signals, now, reruns);
        };
        let task = state.driver.active_task.clone().unwrap_or_default();

        match state.latest_record(&agent_id).map(|r| (r.status, r.outcome)) {
            Some((ExecutionStatus::Running, _)) => {
                let frozen = self.monitor.check_frozen_at(project_id, now)?;
                if let Some(report) = frozen.into_iter().find(|r| r.agent_id == agent_id) {
                    self.release(project_id, &agent_id)?;
                    return Ok(TickOutcome::Frozen {
                        agent_id,
                        duration_ms: report.duration_ms,
                        timeout_seconds: report.timeout_seconds,
                    });
                }
                Ok(TickOutcome::AwaitingCompletion { agent_id })
            }
            Some((ExecutionStatus::Completed, outcome)) => {
                // Completion arrived through a bare status signal
                let result = WorkerResult::from_status(outcome.unwrap_or(WorkerStatus::Success));
                match self.stage_result(project_id, &agent_id, &task, &result)? {
                    Some(outcome) => Ok(outcome),
                    None => self.settle(project_id, &agent_id, &task, signals, DriverPhase::Grading, now, reruns),
                }
            }
            _ => {
                self.release(project_id, &agent_id)?;
                Ok(TickOutcome::Cancelled { agent_id })
            }
        }
    }

    /// The selected agent has a run this call does not own.
    fn busy(&self, project_id: &str, agent_id: &str) -> Result<TickOutcome> {
        warn!("{} is still running on {}; reset it to retry", agent_id, project_id);
        self.idle_with_note(project_id, None, FeedbackKind::Note, agent_id, "selected agent is still running")?;
        Ok(TickOutcome::Busy {
            agent_id: agent_id.to_string(),
        })
    }

    /// Record a note and return the driver to Idle unless a run other than
    /// `owner` holds it.
    fn idle_with_note(
        &self,
        project_id: &str,
        owner: Option<&str>,
        kind: FeedbackKind,
        agent_id: &str,
        message: &str,
    ) -> Result<()> {
        self.store.apply(project_id, &mut |state| {
            let patch = StatePatch::new()
                .feedback(FeedbackEntry::new(kind, state.loop_count, message).for_agent(agent_id));
            if driver_free(state, owner) {
                patch.pending_result(None).driver(DriverState::default())
            } else {
                patch
            }
        })?;
        Ok(())
    }

    /// Return the driver to Idle if `owner` still holds it.
    fn release(&self, project_id: &str, owner: &str) -> Result<()> {
        self.set_driver_if_free(project_id, Some(owner), DriverState::default())?;
        Ok(())
    }

    /// Replace the driver state unless a run other than `owner` holds it.
    ///
    /// Returns the holding agent when the write was skipped.
    fn set_driver_if_free(&self, project_id: &str, owner: Option<&str>, driver: DriverState) -> Result<Option<String>> {
        let mut holder = None;
        self.store.apply(project_id, &mut |state| {
            if driver_free(state, owner) {
                holder = None;
                StatePatch::new().driver(driver.clone())
            } else {
                holder = state.driver.active_agent.clone();
                StatePatch::new()
            }
        })?;
        Ok(holder)
    }

    fn set_driver(&self, project_id: &str, driver: DriverState) -> Result<()> {
        self.store.write(project_id, StatePatch::new().driver(driver))?;
        Ok(())
    }

    fn project_lock(&self, project_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .project_locks
            .lock()
            .map_err(|e| LoopError::StoreUnavailable(e.to_string()))?;
        Ok(locks.entry(project_id.to_string()).or_default().clone())
    }

    fn report(&self, project_id: &str, outcome: TickOutcome, reruns: u32) -> Result<TickReport> {
        let phase = self.store.read(project_id)?.driver.phase;
        Ok(TickReport {
            project_id: project_id.to_string(),
            outcome,
            phase,
            reruns,
        })
    }
}

fn driver_free(state: &ProjectState, owner: Option<&str>) -> bool {
    match state.driver.active_agent.as_deref() {
        None => true,
        Some(active) => owner == Some(active),
    }
}

fn active(phase: DriverPhase, agent_id: &str, task: &str) -> DriverState {
    DriverState {
        phase,
        active_agent: Some(agent_id.to_string()),
        active_task: Some(task.to_string()),
    }
}
