//! agentloop - autonomous step orchestration
//!
//! Given durable per-project execution state, agentloop decides which agent
//! runs next, detects runs that stall past their deadline, grades the
//! self-reflection each agent produces, and decides whether a step is re-run
//! before the loop advances.

pub mod config;
pub mod driver;
pub mod error;
pub mod grader;
pub mod monitor;
pub mod rerun;
pub mod selector;
pub mod store;

pub use error::{LoopError, Result};
