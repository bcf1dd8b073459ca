//! Worker pool executing dispatched jobs.
//!
//! Workers are plain tokio tasks sharing one queue receiver. Each job id
//! pulled from the queue goes through: idempotency check against current
//! descriptor state, compare-and-swap claim, backend submission, then a
//! poll loop until the job reaches a terminal state. Every successful
//! transition re-aggregates and reports the owning event's status.

mod runner;

pub use runner::{WorkerContext, WorkerPool};
