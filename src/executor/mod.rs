//! Worker runtime for the telos orchestration engine.
//!
//! This module hides the execution strategy: how claims turn into running
//! workflow functions, how replay serves memoized step results, and how a
//! lease is kept alive while user code runs.
//!
//! - [`Worker`] owns the claim loop and the per-worker concurrency budget.
//! - [`WorkflowContext`] is the replay-driven handle passed to workflow
//!   functions (`step`, `sleep`, `sleep_until`, `wait_for_signal`).
//! - [`ExecutionError::Suspended`] is the sentinel that unwinds a run when
//!   the workflow durably parks; only the runner's top level consumes it.

mod context;
mod error;
mod runner;
mod worker;

pub use context::{BoxError, WorkflowContext};
pub use error::{ExecutionError, Result, SuspendReason};
pub use runner::HEARTBEAT_INTERVAL;
pub use worker::{Registry, Worker, WorkerHandle};
