//! Rerun/proceed decisions.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::config::RerunConfig;
use crate::error::Result;
use crate::rerun::signals::QualitySignals;
use crate::store::{FeedbackEntry, FeedbackKind, StatePatch, StateStore, rerun_key};

/// What the loop should do with the step just graded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunAction {
    /// Re-invoke the same agent with the same task
    Rerun,
    /// Accept the step and advance
    Proceed,
}

impl RerunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerunAction::Rerun => "rerun",
            RerunAction::Proceed => "proceed",
        }
    }
}

impl std::fmt::Display for RerunAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decision with its reasons and any soft warnings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: RerunAction,

    /// Why a rerun was wanted, whether or not it was granted
    pub reasons: Vec<String>,

    /// Advisory signals and cap warnings
    pub warnings: Vec<String>,

    /// Reruns already used in this iteration chain
    pub rerun_count: u32,

    /// The cap forced a proceed
    pub capped: bool,
}

impl Decision {
    pub fn is_rerun(&self) -> bool {
        self.action == RerunAction::Rerun
    }
}

/// Combines the latest grade with auxiliary signals under one rerun cap.
pub struct RerunEngine {
    store: Arc<dyn StateStore>,
    config: RerunConfig,
}

impl RerunEngine {
    pub fn new(store: Arc<dyn StateStore>, config: RerunConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RerunConfig {
        &self.config
    }

    /// Pure decision.
    ///
    /// A rerun is wanted when `score` is below the threshold or a safety
    /// signal asks for one. Once `rerun_count` reaches the cap the step
    /// proceeds anyway with a warning. Fatigue and bias-echo only warn.
    pub fn decide(&self, score: Option<f64>, signals: &QualitySignals, rerun_count: u32) -> Decision {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if let Some(score) = score
            && score < self.config.score_threshold
        {
            reasons.push(format!(
                "score {:.2} below {:.2}",
                score, self.config.score_threshold
            ));
        }

        if let Some(safety) = signals.safety.as_option()
            && safety.rerun
        {
            reasons.push(format!(
                "safety: {}",
                safety.reason.as_deref().unwrap_or("rerun requested")
            ));
        }

        if let Some(fatigue) = signals.fatigue.as_option()
            && fatigue.level >= self.config.fatigue_warn_level
        {
            let mut warning = format!("fatigue {:.2}", fatigue.level);
            if let Some(note) = &fatigue.note {
                warning.push_str(&format!(" ({})", note));
            }
            warnings.push(warning);
        }

        if let Some(echo) = signals.bias_echo.as_option()
            && echo.detected
        {
            match echo.overlap {
                Some(overlap) => warnings.push(format!("bias echo detected (overlap {:.2})", overlap)),
                None => warnings.push("bias echo detected".to_string()),
            }
        }

        let wants_rerun = !reasons.is_empty();
        let capped = wants_rerun && rerun_count >= self.config.max_reruns;
        if capped {
            warnings.push(format!(
                "rerun cap reached ({}/{}), proceeding",
                rerun_count, self.config.max_reruns
            ));
        }

        Decision {
            action: if wants_rerun && !capped {
                RerunAction::Rerun
            } else {
                RerunAction::Proceed
            },
            reasons,
            warnings,
            rerun_count,
            capped,
        }
    }

    /// Decide for `agent_id` using its latest score and record the outcome.
    ///
    /// The counter bump and the feedback entries are written in the same
    /// atomic update that read the count, so two concurrent evaluations
    /// cannot both spend the last rerun.
    pub fn evaluate(&self, project_id: &str, agent_id: &str, signals: &QualitySignals) -> Result<Decision> {
        self.store.read(project_id)?;

        let mut result = None;
        self.store.apply(project_id, &mut |state| {
            let loop_iteration = state.loop_count;
            let count = state.rerun_count(agent_id, loop_iteration);
            let score = state.latest_score_for(agent_id).map(|s| s.score);
            let decision = self.decide(score, signals, count);

            let mut patch = StatePatch::new();
            if decision.is_rerun() {
                patch = patch.rerun_count(rerun_key(agent_id, loop_iteration), count + 1).feedback(
                    FeedbackEntry::new(FeedbackKind::Rerun, loop_iteration, decision.reasons.join("; "))
                        .for_agent(agent_id),
                );
            }
            for warning in &decision.warnings {
                let kind = if decision.capped && warning.starts_with("rerun cap") {
                    FeedbackKind::RerunCap
                } else {
                    FeedbackKind::Signal
                };
                patch = patch.feedback(FeedbackEntry::new(kind, loop_iteration, warning.clone()).for_agent(agent_id));
            }

            result = Some(decision);
            patch
        })?;

        let decision = result.unwrap_or_else(|| self.decide(None, signals, 0));
        match decision.action {
            RerunAction::Rerun => info!(
                "Rerun {} on {} ({}/{}): {}",
                agent_id,
                project_id,
                decision.rerun_count + 1,
                self.config.max_reruns,
                decision.reasons.join("; ")
            ),
            RerunAction::Proceed if decision.capped => {
                warn!("Rerun cap reached for {} on {}, proceeding", agent_id, project_id)
            }
            RerunAction::Proceed => {}
        }
        Ok(decision)
    }
}
