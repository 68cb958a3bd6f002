//! Worker invocation seam and result decoding.

use log::info;
use serde::Serialize;
use serde_json::Value;

use crate::store::{StagedResult, WorkerStatus};

/// What happened when a worker was handed a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The worker ran inline and returned its raw result
    Finished(Value),
    /// The worker was started elsewhere; completion arrives later
    /// through `LoopDriver::complete_with_result`
    Accepted,
}

/// Trait for handing a task to a worker.
///
/// Implementations must not block waiting on other workers.
pub trait WorkerInvoker: Send + Sync {
    fn invoke(&self, agent_id: &str, task: &str, project_id: &str) -> Dispatch;
}

/// Invoker for workers driven outside the process.
///
/// Every dispatch is `Accepted`; results come back via the CLI `complete`
/// command or `complete_with_result`.
pub struct ManualInvoker;

impl WorkerInvoker for ManualInvoker {
    fn invoke(&self, agent_id: &str, task: &str, project_id: &str) -> Dispatch {
        info!("Dispatched {} on {}: {}", agent_id, project_id, task);
        Dispatch::Accepted
    }
}

/// A worker's result after defensive decoding.
///
/// Missing or mistyped fields fall back to defaults. A missing or
/// non-string `status` is an error outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    pub files_created: Vec<String>,
    pub next_recommended_step: Option<String>,
    pub reflection: Option<Value>,
}

impl WorkerResult {
    pub fn decode(raw: &Value) -> Self {
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .map(WorkerStatus::parse_lenient)
            .unwrap_or(WorkerStatus::Error);

        let files_created = raw
            .get("files_created")
            .and_then(Value::as_array)
            .map(|files| files.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let next_recommended_step = raw
            .get("next_recommended_step")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let reflection = raw.get("reflection").filter(|r| !r.is_null()).cloned();

        Self {
            status,
            files_created,
            next_recommended_step,
            reflection,
        }
    }

    /// A result carrying only a status, for completions reported without a payload.
    pub fn from_status(status: WorkerStatus) -> Self {
        Self {
            status,
            files_created: Vec::new(),
            next_recommended_step: None,
            reflection: None,
        }
    }

    /// The part held back until the step proceeds.
    pub fn staged(&self, agent_id: &str) -> StagedResult {
        StagedResult {
            agent_id: agent_id.to_string(),
            status: self.status,
            files_created: self.files_created.clone(),
            next_recommended_step: self.next_recommended_step.clone(),
        }
    }
}
