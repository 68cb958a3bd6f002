//! Rerun Decision Engine.
//!
//! One engine, one cap: the latest reflection score plus optional quality
//! signals decide whether a step is re-run before the loop advances.

mod engine;
mod signals;

pub use engine::{Decision, RerunAction, RerunEngine};
pub use signals::{BiasEchoSignal, Decoded, FatigueSignal, QualitySignals, SafetySignal, Signal};
