use thiserror::Error;
use uuid::Uuid;

/// Core error type for the telos orchestration engine.
///
/// This error type uses `thiserror` with proper `#[source]` annotations
/// to preserve error chains for debugging and error handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Serialization failed when encoding a value to JSON.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding a JSON value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// An invalid workflow status string was encountered during parsing.
    #[error("invalid workflow status: {0}")]
    InvalidWorkflowStatus(String),

    /// An invalid step status string was encountered during parsing.
    #[error("invalid step status: {0}")]
    InvalidStepStatus(String),

    /// The requested workflow was not found.
    #[error("workflow not found: id={0}")]
    WorkflowNotFound(Uuid),

    /// The requested step was not found.
    #[error("step not found: id={0}")]
    StepNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, Error>;
