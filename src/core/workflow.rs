use super::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a workflow in the orchestrator store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Created and waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker and executing under a lease.
    Running,
    /// Suspended on a durable sleep until `sleep_until` passes.
    Sleeping,
    /// Suspended waiting for an external signal.
    Waiting,
    /// Ran to completion; `output` is set.
    Completed,
    /// Terminated with an error; `error` is set.
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Sleeping => "SLEEPING",
            WorkflowStatus::Waiting => "WAITING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
        }
    }

    /// Returns true if no further transition is possible from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WorkflowStatus::Pending),
            "RUNNING" => Ok(WorkflowStatus::Running),
            "SLEEPING" => Ok(WorkflowStatus::Sleeping),
            "WAITING" => Ok(WorkflowStatus::Waiting),
            "COMPLETED" => Ok(WorkflowStatus::Completed),
            "FAILED" => Ok(WorkflowStatus::Failed),
            _ => Err(Error::InvalidWorkflowStatus(s.to_string())),
        }
    }
}

/// A workflow row as held by the orchestrator store.
///
/// The store exclusively owns this state; workers only ever observe it
/// through the store's read views and mutate it through the guarded
/// transactional operations.
#[derive(Debug, Clone)]
pub struct Workflow {
    /// Opaque unique identifier, issued on insert.
    pub id: Uuid,
    /// Store-assigned monotonic sequence; the global FIFO key.
    pub seq: u64,
    /// Wall time of creation.
    pub created_at: DateTime<Utc>,
    /// Workflow-type label used to route claims to worker registries.
    pub name: String,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// Opaque user input, fixed at creation.
    pub input: Value,
    /// Opaque user output, set only on `Completed`.
    pub output: Option<Value>,
    /// Error message, set only on `Failed`.
    pub error: Option<String>,
    /// Worker holding the current claim (null unless `Running`).
    pub claimed_by: Option<String>,
    /// Wall time of the last lease acquisition or heartbeat.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Wall time after which another worker may reclaim this workflow.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Wake time; set iff `status == Sleeping`.
    pub sleep_until: Option<DateTime<Utc>>,
    /// Durable step-name → step-id mapping; the memoization table that keeps
    /// `get_or_create_step` idempotent across replays and concurrent callers.
    pub step_ids_by_name: HashMap<String, Uuid>,
    /// Signals that arrived before the workflow reached the matching wait.
    pub pending_signals: HashMap<String, Value>,
}

impl Workflow {
    /// Returns true if this workflow has reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the given worker currently holds the claim.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == WorkflowStatus::Running && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// The slice of a claimed workflow handed to a worker's execution slot.
#[derive(Debug, Clone)]
pub struct ClaimedWorkflow {
    pub workflow_id: Uuid,
    pub name: String,
    pub input: Value,
}
