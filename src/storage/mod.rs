//! Persistence layer: the orchestrator store.
//!
//! This module hides the database choice and schema behind the
//! [`OrchestratorStore`] trait. Each trait method is a whole transaction
//! against the backing store; no operation observes another's intermediate
//! state. Two backends are provided: an in-memory store for tests and
//! single-process embedding, and a SQLite store for durable deployments.

mod error;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use error::{Result, StorageError};
pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{PoolConfig, SqliteStore};

use crate::core::{ClaimedWorkflow, SignalWait, StepRecord, StepSnapshot, Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// How long a claim remains valid without a heartbeat.
///
/// After this lease expires, any worker may reclaim the workflow. The lease
/// serves failover, not deadline enforcement.
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// The claim-name wildcard: a `workflow_names` list of exactly `["*"]`
/// scans across all workflow types.
pub const CLAIM_ALL: &str = "*";

/// Returns true if the name list is the claim-everything wildcard.
pub(crate) fn is_wildcard(workflow_names: &[String]) -> bool {
    workflow_names.len() == 1 && workflow_names[0] == CLAIM_ALL
}

/// Transactional operations over the `workflows` and `steps` tables.
///
/// Implementations must be thread-safe and must provide multi-document
/// read/write atomicity per method: every guarded mutation re-reads
/// `claimed_by` inside the same transaction that writes.
///
/// Guarded mutations (`heartbeat`, `complete_workflow`, `fail_workflow`,
/// `sleep_workflow`, `complete_step`, `fail_step`, `schedule_sleep`) return
/// `Ok(false)` when the claim has moved; callers treat that as claim-lost.
/// `get_or_create_step` and `wait_for_signal` instead fail with
/// [`StorageError::NotClaimOwner`] because they have richer return values.
#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    /// Inserts a new workflow with status `Pending` and returns its id.
    async fn start_workflow(&self, name: &str, input: Value) -> Result<Uuid>;

    /// Selects at most one claimable workflow and transitions it to
    /// `Running` under `worker_id` with a fresh lease.
    ///
    /// Selection policy, first match wins:
    /// 1. oldest `Pending`;
    /// 2. `Sleeping` with `sleep_until <= now`, earliest wake first;
    /// 3. `Running` with an expired lease, oldest first (lease renewal only);
    /// 4. legacy rows with `claimed_at` but no lease, past the claim timeout.
    ///
    /// A `workflow_names` of exactly `["*"]` scans globally; otherwise each
    /// tier considers only the listed names. An expired-lease reclaim keeps
    /// the prior step mapping: the new owner replays through completed steps
    /// and re-executes the in-flight step, so that step's side effects are
    /// at-least-once.
    async fn claim(
        &self,
        workflow_names: &[String],
        worker_id: &str,
    ) -> Result<Option<ClaimedWorkflow>>;

    /// Extends the lease. Returns false if the workflow is gone or claimed
    /// by someone else; workers use this as the authoritative "do I still
    /// own this?" signal.
    async fn heartbeat(&self, workflow_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Ownership-guarded terminal transition to `Completed`.
    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        output: Value,
    ) -> Result<bool>;

    /// Ownership-guarded terminal transition to `Failed`.
    async fn fail_workflow(&self, workflow_id: Uuid, worker_id: &str, error: &str) -> Result<bool>;

    /// Ownership-guarded direct transition `Running -> Sleeping`, releasing
    /// the claim. Kept for callers that predate marker-based sleeps;
    /// [`OrchestratorStore::schedule_sleep`] is the canonical operation.
    async fn sleep_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Resolves `step_name` to its durable step, inserting a fresh `Running`
    /// step on first sight. The read-modify-write on the name mapping is
    /// atomic, so two concurrent replays of the same name observe the same
    /// step id. Fails with [`StorageError::NotClaimOwner`] unless the
    /// workflow is currently `Running` under `worker_id`.
    async fn get_or_create_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
        worker_id: &str,
    ) -> Result<StepSnapshot>;

    /// Ownership-guarded (via the parent workflow) completion of a `Running`
    /// step. Rejects with false if the step already settled.
    async fn complete_step(&self, step_id: Uuid, worker_id: &str, output: Value) -> Result<bool>;

    /// Ownership-guarded failure of a `Running` step.
    async fn fail_step(&self, step_id: Uuid, worker_id: &str, error: &str) -> Result<bool>;

    /// Atomically associates a wake time with a sleep-marker step and
    /// transitions the workflow to `Sleeping`, releasing the claim.
    ///
    /// If the marker already carries a wake time it is preferred over
    /// `sleep_until` (replay determinism). Returns false without
    /// transitioning when the effective wake time is not in the future;
    /// the caller must complete the marker instead.
    async fn schedule_sleep(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Consumes a queued signal if one is pending, otherwise registers
    /// `step_id` as the waiter for `signal_name` and transitions the
    /// workflow to `Waiting`, releasing the claim. Fails with
    /// [`StorageError::NotClaimOwner`] if the claim has moved.
    async fn wait_for_signal(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        signal_name: &str,
    ) -> Result<SignalWait>;

    /// Publicly callable signal delivery. If a waiter is registered for
    /// `signal_name`, atomically completes the marker step with the payload
    /// and moves the workflow back to `Pending` for reclaim; otherwise the
    /// payload is queued for a future wait. Returns false if the workflow
    /// does not exist or is terminal.
    async fn signal_workflow(
        &self,
        workflow_id: Uuid,
        signal_name: &str,
        payload: Value,
    ) -> Result<bool>;

    /// Fetches one workflow with its step-name mapping and queued signals.
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>>;

    /// Lists workflows, optionally filtered by name and status, oldest
    /// first. Rows are summaries: the step-id and signal maps are not
    /// populated.
    async fn list_workflows(
        &self,
        name: Option<&str>,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>>;

    /// Fetches all steps of a workflow in creation order.
    async fn get_workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>>;

    /// Returns true if any workflow matching `workflow_names` is claimable
    /// right now (pending, or sleeping with a due wake time). This is the
    /// pollable form of the pending-work signal.
    async fn has_claimable(&self, workflow_names: &[String]) -> Result<bool>;

    /// Notification handle fired when new claimable work appears (a started
    /// workflow, or a signalled waiter moving back to pending). Strictly a
    /// latency optimization; the claim-loop timer provides correctness.
    fn work_notify(&self) -> &Arc<Notify>;
}
