//! Reflection Grader.
//!
//! Scores a worker's self-reflection on a 0.0..=1.0 scale. Every payload
//! starts at 1.0 and loses points for each independent problem found:
//!
//! | Problem                                  | Deduction |
//! |------------------------------------------|-----------|
//! | required field missing or mistyped       | 0.30      |
//! | confidence below minimum                 | 0.20      |
//! | no loop-reference tag                    | 0.10      |
//! | summary does not cover the goal          | 0.15      |
//! | summary too short                        | 0.10      |
//! | summary too long                         | 0.05      |
//!
//! The result is floored at 0.0 and rounded to two decimals. Scores below
//! the weak threshold are weak.

mod reflection;

pub use reflection::{Reflection, goal_keywords, keyword_overlap};

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GraderConfig;
use crate::error::Result;
use crate::store::{ReflectionScore, StatePatch, StateStore, generate_reflection_id, now_ms};

const SCHEMA_PENALTY: f64 = 0.3;
const CONFIDENCE_PENALTY: f64 = 0.2;
const LOOP_TAG_PENALTY: f64 = 0.1;
const OVERLAP_PENALTY: f64 = 0.15;
const SHORT_PENALTY: f64 = 0.1;
const LONG_PENALTY: f64 = 0.05;

/// Outcome of grading one reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub score: f64,
    pub issues: Vec<String>,
    pub weak: bool,
}

/// Grade a decoded reflection.
///
/// `fallback_goal` is used when the reflection carries no goal of its own;
/// with neither, the overlap check is skipped.
pub fn grade_reflection(reflection: &Reflection, fallback_goal: Option<&str>, config: &GraderConfig) -> Grade {
    let mut score = 1.0;
    let mut issues = Vec::new();

    if !reflection.schema_ok {
        score -= SCHEMA_PENALTY;
        let fields = if reflection.schema_errors.is_empty() {
            "payload".to_string()
        } else {
            reflection.schema_errors.join(", ")
        };
        issues.push(format!("schema mismatch: {}", fields));
    }

    if reflection.confidence < config.min_confidence {
        score -= CONFIDENCE_PENALTY;
        issues.push(format!(
            "low confidence ({:.2} < {:.2})",
            reflection.confidence, config.min_confidence
        ));
    }

    if !reflection.has_loop_tag(&config.loop_tag) {
        score -= LOOP_TAG_PENALTY;
        issues.push(format!("missing '{}' reference tag", config.loop_tag));
    }

    let goal = reflection.goal.as_deref().or(fallback_goal);
    if let Some(goal) = goal
        && let Some(overlap) = keyword_overlap(&reflection.summary, goal)
        && overlap < config.overlap_threshold
    {
        score -= OVERLAP_PENALTY;
        issues.push(format!(
            "summary does not address goal (overlap {:.2} < {:.2})",
            overlap, config.overlap_threshold
        ));
    }

    let len = reflection.summary.chars().count();
    if len < config.min_summary_len {
        score -= SHORT_PENALTY;
        issues.push(format!("summary too short ({} < {} chars)", len, config.min_summary_len));
    }
    if len > config.max_summary_len {
        score -= LONG_PENALTY;
        issues.push(format!("summary too long ({} > {} chars)", len, config.max_summary_len));
    }

    let score = round2(f64::max(score, 0.0));
    Grade {
        score,
        weak: score < config.weak_threshold,
        issues,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Grades the pending reflection of a project and records the score.
pub struct ReflectionGrader {
    store: Arc<dyn StateStore>,
    config: GraderConfig,
}

impl ReflectionGrader {
    pub fn new(store: Arc<dyn StateStore>, config: GraderConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    /// Grade a raw payload without touching the store.
    pub fn grade_payload(&self, raw: &Value, fallback_goal: Option<&str>) -> Grade {
        grade_reflection(&Reflection::decode(raw), fallback_goal, &self.config)
    }

    /// Grade `pending_reflection`, append the score and clear the pending payload.
    ///
    /// A project with no pending reflection is graded as an empty payload.
    pub fn grade(&self, project_id: &str) -> Result<Grade> {
        // Surface NotFound rather than creating a record
        self.store.read(project_id)?;

        let mut result = None;
        self.store.apply(project_id, &mut |state| {
            let raw = state.pending_reflection.clone().unwrap_or(Value::Null);
            let reflection = Reflection::decode(&raw);
            let grade = grade_reflection(&reflection, state.current_task.as_deref(), &self.config);

            let agent_id = reflection
                .agent_id
                .clone()
                .or_else(|| state.driver.active_agent.clone())
                .or_else(|| state.last_completed_agent.clone());
            let entry = ReflectionScore {
                reflection_id: generate_reflection_id(),
                agent_id,
                score: grade.score,
                issues: grade.issues.clone(),
                weak: grade.weak,
                loop_iteration: state.loop_count,
                timestamp: now_ms(),
            };
            result = Some(grade);

            StatePatch::new().reflection_score(entry).pending_reflection(None)
        })?;

        let grade = result.unwrap_or(Grade {
            score: 0.0,
            issues: Vec::new(),
            weak: true,
        });
        if grade.weak {
            info!("Weak reflection on {}: {:.2} {:?}", project_id, grade.score, grade.issues);
        } else {
            debug!("Reflection on {} scored {:.2}", project_id, grade.score);
        }
        Ok(grade)
    }
}
