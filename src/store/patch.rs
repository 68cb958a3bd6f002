//! Partial writes and their merge rules.
//!
//! Scalars in a patch replace the stored value, except `loop_count`, which
//! only moves forward. Lists and sets are merged by append or union, so two
//! patches applied one after the other never lose each other's entries.

use std::collections::BTreeMap;

use crate::store::records::{
    DriverState, ExecutionRecord, FeedbackEntry, FrozenAlert, ProjectState, ReflectionScore, StagedResult,
};

/// A partial update to a `ProjectState`.
///
/// `None` leaves a scalar untouched. Optional scalars use a nested `Option`
/// so they can be cleared (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub loop_count: Option<u64>,
    pub last_completed_agent: Option<String>,
    pub next_recommended_step: Option<Option<String>>,
    pub current_task: Option<Option<String>>,
    pub pending_reflection: Option<Option<serde_json::Value>>,
    pub pending_result: Option<Option<StagedResult>>,
    pub driver: Option<DriverState>,

    /// Appended, skipping entries already present
    pub completed_steps: Vec<String>,
    /// Unioned
    pub agents_involved: Vec<String>,
    /// Appended
    pub files_created: Vec<String>,
    /// Appended to `execution_log[record.agent_id]`
    pub execution_records: Vec<ExecutionRecord>,
    /// Unioned on (agent, start_time)
    pub frozen_alerts: Vec<FrozenAlert>,
    /// Appended; weak scores are also appended to `weak_reflections`
    pub reflection_scores: Vec<ReflectionScore>,
    /// Appended
    pub feedback: Vec<FeedbackEntry>,
    /// Replaced per key
    pub rerun_counts: BTreeMap<String, u32>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the loop counter to `value`; a lower value is ignored.
    pub fn loop_count(mut self, value: u64) -> Self {
        self.loop_count = Some(value);
        self
    }

    pub fn last_completed_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.last_completed_agent = Some(agent_id.into());
        self
    }

    pub fn next_recommended_step(mut self, text: Option<String>) -> Self {
        self.next_recommended_step = Some(text);
        self
    }

    pub fn current_task(mut self, task: Option<String>) -> Self {
        self.current_task = Some(task);
        self
    }

    pub fn pending_reflection(mut self, payload: Option<serde_json::Value>) -> Self {
        self.pending_reflection = Some(payload);
        self
    }

    pub fn pending_result(mut self, staged: Option<StagedResult>) -> Self {
        self.pending_result = Some(staged);
        self
    }

    pub fn driver(mut self, driver: DriverState) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn completed_step(mut self, step: impl Into<String>) -> Self {
        self.completed_steps.push(step.into());
        self
    }

    pub fn agent_involved(mut self, agent_id: impl Into<String>) -> Self {
        self.agents_involved.push(agent_id.into());
        self
    }

    pub fn files(mut self, files: impl IntoIterator<Item = String>) -> Self {
        self.files_created.extend(files);
        self
    }

    pub fn execution_record(mut self, record: ExecutionRecord) -> Self {
        self.execution_records.push(record);
        self
    }

    pub fn frozen_alert(mut self, alert: FrozenAlert) -> Self {
        self.frozen_alerts.push(alert);
        self
    }

    pub fn reflection_score(mut self, score: ReflectionScore) -> Self {
        self.reflection_scores.push(score);
        self
    }

    pub fn feedback(mut self, entry: FeedbackEntry) -> Self {
        self.feedback.push(entry);
        self
    }

    pub fn rerun_count(mut self, key: impl Into<String>, count: u32) -> Self {
        self.rerun_counts.insert(key.into(), count);
        self
    }

    /// True when applying this patch would change nothing but `updated_at`.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge this patch into `state`.
    pub fn apply_to(self, state: &mut ProjectState) {
        if let Some(count) = self.loop_count {
            state.loop_count = state.loop_count.max(count);
        }
        if let Some(agent) = self.last_completed_agent {
            state.last_completed_agent = Some(agent);
        }
        if let Some(step) = self.next_recommended_step {
            state.next_recommended_step = step;
        }
        if let Some(task) = self.current_task {
            state.current_task = task;
        }
        if let Some(payload) = self.pending_reflection {
            state.pending_reflection = payload;
        }
        if let Some(staged) = self.pending_result {
            state.pending_result = staged;
        }
        if let Some(driver) = self.driver {
            state.driver = driver;
        }

        for step in self.completed_steps {
            if !state.completed_steps.contains(&step) {
                state.completed_steps.push(step);
            }
        }
        state.agents_involved.extend(self.agents_involved);
        state.files_created.extend(self.files_created);

        for record in self.execution_records {
            state
                .execution_log
                .entry(record.agent_id.clone())
                .or_default()
                .push(record);
        }

        for alert in self.frozen_alerts {
            if !state.frozen_agents.iter().any(|a| a.same_stall(&alert)) {
                state.frozen_agents.push(alert);
            }
        }

        for score in self.reflection_scores {
            if score.weak {
                state.weak_reflections.push(score.clone());
            }
            state.reflection_scores.push(score);
        }

        state.feedback_log.extend(self.feedback);
        state.rerun_counts.extend(self.rerun_counts);

        state.touch();
    }
}
