use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a workflow left its worker before finishing.
///
/// Suspension is not a failure: by the time the sentinel is thrown the store
/// has already durably transitioned the workflow to `Sleeping` or `Waiting`
/// and released the claim.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendReason {
    /// Parked on a durable sleep until the wake time.
    Sleep { wake_at: DateTime<Utc> },
    /// Parked until the named signal arrives.
    Signal { signal_name: String, marker: String },
}

/// Execution layer error type for the telos worker runtime.
///
/// `Suspended` and `ClaimLost` are control flow, not failures: workflow code
/// propagates them with `?` and only the runner's top level consumes them,
/// so they never surface to user error handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The workflow durably suspended (sleep or signal wait); execution
    /// resumes on a later claim by replaying from the top.
    #[error("workflow suspended")]
    Suspended(SuspendReason),

    /// The claim moved to another worker; all further writes from this
    /// execution are dead and the runner stops quietly.
    #[error("claim lost: workflow is no longer owned by this worker")]
    ClaimLost,

    /// A store operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A step activity failed, either live or replayed from the stored
    /// error. Bubbles out of `ctx.step` as if the activity threw.
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// Workflow code broke a runtime contract (nested suspension inside a
    /// step, a missing marker, a reserved step name).
    #[error("{0}")]
    Contract(String),

    /// Workflow-level failure raised by user code.
    #[error("{0}")]
    Failed(String),
}

impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        match e {
            // A moved claim shows up as an ownership error on the
            // step-resolving operations; fold it into claim-lost.
            StorageError::NotClaimOwner { .. } => ExecutionError::ClaimLost,
            other => ExecutionError::Storage(other.to_string()),
        }
    }
}

impl From<crate::core::Error> for ExecutionError {
    fn from(e: crate::core::Error) -> Self {
        ExecutionError::Failed(e.to_string())
    }
}

impl From<String> for ExecutionError {
    fn from(s: String) -> Self {
        ExecutionError::Failed(s)
    }
}

impl From<&str> for ExecutionError {
    fn from(s: &str) -> Self {
        ExecutionError::Failed(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
