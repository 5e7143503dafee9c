//! Telos: Durable Workflow Orchestrator for Rust
//!
//! `telos` (τέλος, Greek for "end" or "completion") is a durable workflow
//! orchestrator with a pull-based worker model: orchestration state lives in
//! a transactional store, while workflow code and its side-effecting
//! activities run on worker processes that claim work under a time-bounded
//! lease.
//!
//! # Features
//!
//! - **Durable execution**: every step result is persisted before the
//!   workflow advances, so a crash or takeover never re-commits a finished
//!   step
//! - **Leased claims**: a workflow runs under exactly one live worker; an
//!   expired lease is always reclaimable by any other worker
//! - **Replay-driven suspension**: durable sleeps and signal waits park the
//!   workflow in the store; on wake, the function replays from the top and
//!   completed work is served from storage
//! - **Pull-based workers**: workers poll (with a reactive wakeup shortcut)
//!   and enforce a per-worker concurrency budget
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use telos::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     let worker = Worker::new(Arc::clone(&store));
//!     worker
//!         .register("greet", |ctx| async move {
//!             let name: String = ctx.typed_input()?;
//!             let greeting: String = ctx
//!                 .step("hi", || async move { Ok::<_, String>(format!("Hello, {name}!")) })
//!                 .await?;
//!             Ok(serde_json::json!({ "greeting": greeting }))
//!         })
//!         .await;
//!     let handle = worker.start();
//!
//!     let id = store.start_workflow("greet", serde_json::json!("W")).await?;
//!     // ... observe completion via store.get_workflow(id)
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! Each module hides a design decision that is likely to change:
//!
//! - [`core`]: foundation types (hides the serialization format)
//! - [`storage`]: the orchestrator store (hides database choice and schema)
//! - [`executor`]: the worker runtime (hides the execution strategy)
//! - [`service`]: the endpoint facade (hides the transport)

pub mod core;
pub mod executor;
pub mod service;
pub mod storage;

// Re-export commonly used types for convenience
pub use crate::core::{
    deserialize_value, serialize_value, ClaimedWorkflow, SignalWait, StepRecord, StepSnapshot,
    StepStatus, Workflow, WorkflowStatus,
};

pub use executor::{
    BoxError, ExecutionError, Registry, SuspendReason, Worker, WorkerHandle, WorkflowContext,
    HEARTBEAT_INTERVAL,
};

pub use service::{Authorizer, Service};

pub use storage::{InMemoryStore, OrchestratorStore, StorageError, CLAIM_ALL, CLAIM_TIMEOUT};

#[cfg(feature = "sqlite")]
pub use storage::{PoolConfig, SqliteStore};

// Re-export dependencies used in the public API so downstream crates do not
// hit version mismatches.
pub use serde;
pub use serde_json;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```ignore
/// use telos::prelude::*;
/// ```
pub mod prelude {
    pub use crate::executor::{ExecutionError, Worker, WorkerHandle, WorkflowContext};
    pub use crate::storage::{InMemoryStore, OrchestratorStore};
    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteStore;
    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
