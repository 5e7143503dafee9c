use crate::core::Error as CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type for the telos orchestration engine.
///
/// Ownership failures on guarded mutations are reported as `Ok(false)` by the
/// store operations, not as errors; this enum covers the cases where the call
/// itself cannot proceed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// A connection or configuration problem.
    #[error("connection error: {0}")]
    Connection(String),

    /// A core serialization or status-parsing error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The requested workflow was not found in storage.
    #[error("workflow not found: id={0}")]
    WorkflowNotFound(Uuid),

    /// The requested step was not found in storage.
    #[error("step not found: id={0}")]
    StepNotFound(Uuid),

    /// A step-creating operation ran against a workflow the caller does not
    /// currently own. The worker runtime treats this as a lost claim.
    #[error("workflow {workflow_id} is not running under worker {worker_id}")]
    NotClaimOwner { workflow_id: Uuid, worker_id: String },

    /// A worker endpoint was called with a credential the authorizer rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
