//! Loop Driver.
//!
//! Request-driven: every call does a bounded amount of work and returns.
//! Nothing here sleeps or waits on a worker; the caller sequences ticks and
//! decides how often to poll for frozen runs.

mod invoker;
mod loop_driver;

pub use invoker::{Dispatch, ManualInvoker, WorkerInvoker, WorkerResult};
pub use loop_driver::{LoopDriver, TickOutcome, TickReport};
