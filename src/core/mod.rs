//! Foundation types for the telos orchestration engine.
//!
//! This module hides the serialization format and the shape of the two
//! persistent entities (workflows and steps). Everything else in the crate
//! builds on these types.

mod error;
mod serialization;
mod step;
mod workflow;

pub use error::{Error, Result};
pub use serialization::{deserialize_value, serialize_value};
pub use step::{
    is_reserved_step_name, signal_step_name, sleep_step_name, SignalWait, StepRecord,
    StepSnapshot, StepStatus, SIGNAL_STEP_PREFIX, SLEEP_STEP_PREFIX,
};
pub use workflow::{ClaimedWorkflow, Workflow, WorkflowStatus};
