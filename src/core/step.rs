use super::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Reserved prefix for durable-sleep marker steps.
pub const SLEEP_STEP_PREFIX: &str = "__sleep:";

/// Reserved prefix for signal-wait marker steps.
pub const SIGNAL_STEP_PREFIX: &str = "__signal:";

/// Builds the synthetic step name for a sleep marker.
pub fn sleep_step_name(marker: &str) -> String {
    format!("{SLEEP_STEP_PREFIX}{marker}")
}

/// Builds the synthetic step name for a signal-wait marker.
///
/// `":"` separates the signal name from the marker, so the same signal can be
/// awaited at several points of a workflow under distinct markers.
pub fn signal_step_name(signal_name: &str, marker: &str) -> String {
    format!("{SIGNAL_STEP_PREFIX}{signal_name}:{marker}")
}

/// Returns true if a step name uses one of the reserved synthetic prefixes.
///
/// User step names must never collide with marker names; the worker context
/// rejects them before they reach the store.
pub fn is_reserved_step_name(name: &str) -> bool {
    name.starts_with(SLEEP_STEP_PREFIX) || name.starts_with(SIGNAL_STEP_PREFIX)
}

/// Status of a single step within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Reserved for future scheduling; steps are created `Running` today.
    Pending,
    /// Created under the parent's claim; the activity may be in flight.
    Running,
    /// The activity result was durably recorded.
    Completed,
    /// The activity error was durably recorded.
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "RUNNING" => Ok(StepStatus::Running),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            _ => Err(Error::InvalidStepStatus(s.to_string())),
        }
    }
}

/// A step row as held by the orchestrator store.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// User step name, or a synthetic marker name for sleeps and signal waits.
    pub name: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Wake time; set only on sleep-marker steps.
    pub sleep_until: Option<DateTime<Utc>>,
    /// Signal name; set only on signal-marker steps while the workflow waits.
    pub awaiting_signal: Option<String>,
    /// Always 1 in this engine; reserved for future retry.
    pub attempts: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The result of `get_or_create_step`: everything the replaying context needs
/// to decide whether to serve a memoized result or execute the activity.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub step_id: Uuid,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub sleep_until: Option<DateTime<Utc>>,
    /// True if this call inserted the step; false on every replay.
    pub is_new: bool,
}

/// Outcome of registering a signal wait with the store.
#[derive(Debug, Clone)]
pub enum SignalWait {
    /// No matching signal had arrived; the workflow transitioned to
    /// `Waiting` and the claim was released.
    Waiting,
    /// A queued signal was consumed; the payload is returned immediately
    /// and the workflow keeps running.
    Signaled(Value),
}
