//! Transport facade over the orchestrator store.
//!
//! The store exposes two classes of endpoints: **public** operations safe
//! for clients and dashboards, and **worker** operations that mutate claim
//! and step state and must sit behind a credential check. This facade is
//! the seam an HTTP or RPC handler layer calls into; the authorization
//! predicate is supplied by the embedding application.

use crate::core::{
    ClaimedWorkflow, SignalWait, StepRecord, StepSnapshot, Workflow, WorkflowStatus,
};
use crate::storage::{OrchestratorStore, Result, StorageError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Predicate deciding whether a worker credential may call worker endpoints.
pub type Authorizer = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// High-level service over a store, splitting the public surface from the
/// credential-guarded worker surface.
pub struct Service<S> {
    store: Arc<S>,
    authorize: Authorizer,
}

impl<S: OrchestratorStore> Service<S> {
    pub fn new(store: Arc<S>, authorize: Authorizer) -> Self {
        Self { store, authorize }
    }

    fn check(&self, credential: &str) -> Result<()> {
        if (self.authorize)(credential) {
            Ok(())
        } else {
            Err(StorageError::Unauthorized(
                "worker credential rejected".to_string(),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Public endpoints
    // ------------------------------------------------------------------

    pub async fn start_workflow(&self, name: &str, input: Value) -> Result<Uuid> {
        self.store.start_workflow(name, input).await
    }

    pub async fn signal_workflow(
        &self,
        workflow_id: Uuid,
        signal_name: &str,
        payload: Value,
    ) -> Result<bool> {
        self.store
            .signal_workflow(workflow_id, signal_name, payload)
            .await
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        self.store.get_workflow(workflow_id).await
    }

    pub async fn list_workflows(
        &self,
        name: Option<&str>,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>> {
        self.store.list_workflows(name, status).await
    }

    pub async fn get_workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>> {
        self.store.get_workflow_steps(workflow_id).await
    }

    // ------------------------------------------------------------------
    // Worker endpoints (credential required)
    // ------------------------------------------------------------------

    pub async fn claim(
        &self,
        credential: &str,
        workflow_names: &[String],
        worker_id: &str,
    ) -> Result<Option<ClaimedWorkflow>> {
        self.check(credential)?;
        self.store.claim(workflow_names, worker_id).await
    }

    pub async fn heartbeat(
        &self,
        credential: &str,
        workflow_id: Uuid,
        worker_id: &str,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store.heartbeat(workflow_id, worker_id).await
    }

    pub async fn complete_workflow(
        &self,
        credential: &str,
        workflow_id: Uuid,
        worker_id: &str,
        output: Value,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store
            .complete_workflow(workflow_id, worker_id, output)
            .await
    }

    pub async fn fail_workflow(
        &self,
        credential: &str,
        workflow_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store.fail_workflow(workflow_id, worker_id, error).await
    }

    pub async fn sleep_workflow(
        &self,
        credential: &str,
        workflow_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store
            .sleep_workflow(workflow_id, worker_id, sleep_until)
            .await
    }

    pub async fn get_or_create_step(
        &self,
        credential: &str,
        workflow_id: Uuid,
        step_name: &str,
        worker_id: &str,
    ) -> Result<StepSnapshot> {
        self.check(credential)?;
        self.store
            .get_or_create_step(workflow_id, step_name, worker_id)
            .await
    }

    pub async fn complete_step(
        &self,
        credential: &str,
        step_id: Uuid,
        worker_id: &str,
        output: Value,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store.complete_step(step_id, worker_id, output).await
    }

    pub async fn fail_step(
        &self,
        credential: &str,
        step_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store.fail_step(step_id, worker_id, error).await
    }

    pub async fn schedule_sleep(
        &self,
        credential: &str,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.check(credential)?;
        self.store
            .schedule_sleep(workflow_id, step_id, worker_id, sleep_until)
            .await
    }

    pub async fn wait_for_signal(
        &self,
        credential: &str,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        signal_name: &str,
    ) -> Result<SignalWait> {
        self.check(credential)?;
        self.store
            .wait_for_signal(workflow_id, step_id, worker_id, signal_name)
            .await
    }

    pub async fn has_claimable(
        &self,
        credential: &str,
        workflow_names: &[String],
    ) -> Result<bool> {
        self.check(credential)?;
        self.store.has_claimable(workflow_names).await
    }
}
