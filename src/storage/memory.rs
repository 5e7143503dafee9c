use super::{is_wildcard, OrchestratorStore, Result, StorageError, CLAIM_TIMEOUT};
use crate::core::{
    ClaimedWorkflow, SignalWait, StepRecord, StepSnapshot, StepStatus, Workflow, WorkflowStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// In-memory orchestrator store.
///
/// The whole state sits behind one mutex: each trait method takes the lock
/// once, which makes every operation a serialized multi-document transaction.
/// That is exactly the isolation the claim protocol needs, and it keeps this
/// backend honest as the reference implementation for the SQLite store.
///
/// Suitable for tests and single-process embedding only; nothing survives a
/// restart.
pub struct InMemoryStore {
    state: Mutex<State>,
    claim_timeout: Duration,
    work_notify: Arc<Notify>,
}

struct State {
    workflows: HashMap<Uuid, Workflow>,
    steps: HashMap<Uuid, StepRecord>,
    next_seq: u64,
}

impl InMemoryStore {
    /// Creates an empty in-memory store with the default 30-second lease.
    pub fn new() -> Self {
        Self::with_claim_timeout(CLAIM_TIMEOUT)
    }

    /// Creates a store with a custom lease duration. Short leases make
    /// failover paths testable without waiting out the production timeout.
    pub fn with_claim_timeout(claim_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                workflows: HashMap::new(),
                steps: HashMap::new(),
                next_seq: 0,
            }),
            claim_timeout,
            work_notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store mutex poisoned")
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn guard_owner(&self, workflow_id: Uuid, worker_id: &str) -> Result<&Workflow> {
        let workflow = self
            .workflows
            .get(&workflow_id)
            .ok_or(StorageError::WorkflowNotFound(workflow_id))?;
        if !workflow.is_claimed_by(worker_id) {
            return Err(StorageError::NotClaimOwner {
                workflow_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(workflow)
    }

    /// Applies the claim selection policy and returns the winning workflow id.
    fn select_claimable(
        &self,
        workflow_names: &[String],
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Option<Uuid> {
        let wildcard = is_wildcard(workflow_names);
        let matches_name = |w: &Workflow| wildcard || workflow_names.iter().any(|n| *n == w.name);
        let candidates = || self.workflows.values().filter(|w| matches_name(w));

        // Tier 1: oldest pending.
        if let Some(w) = candidates()
            .filter(|w| w.status == WorkflowStatus::Pending)
            .min_by_key(|w| w.seq)
        {
            return Some(w.id);
        }

        // Tier 2: due sleeper, earliest wake first.
        if let Some(w) = candidates()
            .filter(|w| {
                w.status == WorkflowStatus::Sleeping && w.sleep_until.is_some_and(|t| t <= now)
            })
            .min_by_key(|w| (w.sleep_until, w.seq))
        {
            return Some(w.id);
        }

        // Tier 3: expired lease, oldest first.
        if let Some(w) = candidates()
            .filter(|w| {
                w.status == WorkflowStatus::Running
                    && w.lease_expires_at.is_some_and(|t| t < now)
            })
            .min_by_key(|w| w.seq)
        {
            return Some(w.id);
        }

        // Tier 4: legacy rows carrying claimed_at but no lease.
        let legacy_cutoff = now - chrono::Duration::from_std(claim_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        candidates()
            .filter(|w| {
                w.status == WorkflowStatus::Running
                    && w.lease_expires_at.is_none()
                    && w.claimed_at.is_some_and(|t| t <= legacy_cutoff)
            })
            .min_by_key(|w| w.seq)
            .map(|w| w.id)
    }
}

#[async_trait]
impl OrchestratorStore for InMemoryStore {
    async fn start_workflow(&self, name: &str, input: Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.workflows.insert(
                id,
                Workflow {
                    id,
                    seq,
                    created_at: Utc::now(),
                    name: name.to_string(),
                    status: WorkflowStatus::Pending,
                    input,
                    output: None,
                    error: None,
                    claimed_by: None,
                    claimed_at: None,
                    lease_expires_at: None,
                    sleep_until: None,
                    step_ids_by_name: HashMap::new(),
                    pending_signals: HashMap::new(),
                },
            );
        }
        debug!("started workflow: id={}, name={}", id, name);
        self.work_notify.notify_one();
        Ok(id)
    }

    async fn claim(
        &self,
        workflow_names: &[String],
        worker_id: &str,
    ) -> Result<Option<ClaimedWorkflow>> {
        let now = Utc::now();
        let mut state = self.lock();

        let Some(id) = state.select_claimable(workflow_names, now, self.claim_timeout) else {
            return Ok(None);
        };

        let lease = chrono::Duration::from_std(self.claim_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let workflow = state.workflows.get_mut(&id).expect("selected id exists");
        workflow.status = WorkflowStatus::Running;
        workflow.claimed_by = Some(worker_id.to_string());
        workflow.claimed_at = Some(now);
        workflow.lease_expires_at = Some(now + lease);
        workflow.sleep_until = None;

        debug!(
            "claimed workflow: id={}, name={}, worker={}",
            id, workflow.name, worker_id
        );
        Ok(Some(ClaimedWorkflow {
            workflow_id: id,
            name: workflow.name.clone(),
            input: workflow.input.clone(),
        }))
    }

    async fn heartbeat(&self, workflow_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.claim_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.lock();
        let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
            return Ok(false);
        };
        if workflow.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        workflow.claimed_at = Some(now);
        workflow.lease_expires_at = Some(now + lease);
        Ok(true)
    }

    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        output: Value,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
            return Ok(false);
        };
        if !workflow.is_claimed_by(worker_id) {
            return Ok(false);
        }
        workflow.status = WorkflowStatus::Completed;
        workflow.output = Some(output);
        workflow.claimed_by = None;
        workflow.claimed_at = None;
        workflow.lease_expires_at = None;
        workflow.sleep_until = None;
        debug!("completed workflow: id={}", workflow_id);
        Ok(true)
    }

    async fn fail_workflow(&self, workflow_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
            return Ok(false);
        };
        if !workflow.is_claimed_by(worker_id) {
            return Ok(false);
        }
        workflow.status = WorkflowStatus::Failed;
        workflow.error = Some(error.to_string());
        workflow.claimed_by = None;
        workflow.claimed_at = None;
        workflow.lease_expires_at = None;
        workflow.sleep_until = None;
        debug!("failed workflow: id={}, error={}", workflow_id, error);
        Ok(true)
    }

    async fn sleep_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
            return Ok(false);
        };
        if !workflow.is_claimed_by(worker_id) {
            return Ok(false);
        }
        workflow.status = WorkflowStatus::Sleeping;
        workflow.sleep_until = Some(sleep_until);
        workflow.claimed_by = None;
        workflow.claimed_at = None;
        workflow.lease_expires_at = None;
        Ok(true)
    }

    async fn get_or_create_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
        worker_id: &str,
    ) -> Result<StepSnapshot> {
        let mut state = self.lock();
        state.guard_owner(workflow_id, worker_id)?;

        let existing = state
            .workflows
            .get(&workflow_id)
            .and_then(|w| w.step_ids_by_name.get(step_name))
            .copied();

        if let Some(step_id) = existing {
            let step = state
                .steps
                .get(&step_id)
                .ok_or(StorageError::StepNotFound(step_id))?;
            return Ok(StepSnapshot {
                step_id,
                status: step.status,
                output: step.output.clone(),
                error: step.error.clone(),
                sleep_until: step.sleep_until,
                is_new: false,
            });
        }

        let step_id = Uuid::new_v4();
        let now = Utc::now();
        state.steps.insert(
            step_id,
            StepRecord {
                id: step_id,
                workflow_id,
                name: step_name.to_string(),
                status: StepStatus::Running,
                output: None,
                error: None,
                sleep_until: None,
                awaiting_signal: None,
                attempts: 1,
                started_at: now,
                completed_at: None,
            },
        );
        state
            .workflows
            .get_mut(&workflow_id)
            .expect("guarded above")
            .step_ids_by_name
            .insert(step_name.to_string(), step_id);

        debug!(
            "created step: workflow={}, name={}, step={}",
            workflow_id, step_name, step_id
        );
        Ok(StepSnapshot {
            step_id,
            status: StepStatus::Running,
            output: None,
            error: None,
            sleep_until: None,
            is_new: true,
        })
    }

    async fn complete_step(&self, step_id: Uuid, worker_id: &str, output: Value) -> Result<bool> {
        let mut state = self.lock();
        let Some(workflow_id) = state.steps.get(&step_id).map(|s| s.workflow_id) else {
            return Ok(false);
        };
        if state.guard_owner(workflow_id, worker_id).is_err() {
            return Ok(false);
        }
        let step = state.steps.get_mut(&step_id).expect("looked up above");
        if step.status != StepStatus::Running {
            return Ok(false);
        }
        step.status = StepStatus::Completed;
        step.output = Some(output);
        step.error = None;
        step.sleep_until = None;
        step.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail_step(&self, step_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(workflow_id) = state.steps.get(&step_id).map(|s| s.workflow_id) else {
            return Ok(false);
        };
        if state.guard_owner(workflow_id, worker_id).is_err() {
            return Ok(false);
        }
        let step = state.steps.get_mut(&step_id).expect("looked up above");
        if step.status != StepStatus::Running {
            return Ok(false);
        }
        step.status = StepStatus::Failed;
        step.error = Some(error.to_string());
        step.sleep_until = None;
        step.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn schedule_sleep(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.lock();
        if state.guard_owner(workflow_id, worker_id).is_err() {
            return Ok(false);
        }
        let Some(step) = state.steps.get(&step_id) else {
            return Ok(false);
        };
        if step.workflow_id != workflow_id || step.status != StepStatus::Running {
            return Ok(false);
        }

        // A marker's wake time is written once; replays observe the original.
        let wake_at = step.sleep_until.unwrap_or(sleep_until);
        if wake_at <= now {
            return Ok(false);
        }

        state
            .steps
            .get_mut(&step_id)
            .expect("looked up above")
            .sleep_until = Some(wake_at);
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .expect("guarded above");
        workflow.status = WorkflowStatus::Sleeping;
        workflow.sleep_until = Some(wake_at);
        workflow.claimed_by = None;
        workflow.claimed_at = None;
        workflow.lease_expires_at = None;
        debug!(
            "scheduled sleep: workflow={}, step={}, wake_at={}",
            workflow_id, step_id, wake_at
        );
        Ok(true)
    }

    async fn wait_for_signal(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        signal_name: &str,
    ) -> Result<SignalWait> {
        let mut state = self.lock();
        state.guard_owner(workflow_id, worker_id)?;

        let queued = state
            .workflows
            .get_mut(&workflow_id)
            .expect("guarded above")
            .pending_signals
            .remove(signal_name);
        if let Some(payload) = queued {
            debug!(
                "consumed queued signal: workflow={}, signal={}",
                workflow_id, signal_name
            );
            return Ok(SignalWait::Signaled(payload));
        }

        let Some(step) = state.steps.get_mut(&step_id) else {
            return Err(StorageError::StepNotFound(step_id));
        };
        step.awaiting_signal = Some(signal_name.to_string());
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .expect("guarded above");
        workflow.status = WorkflowStatus::Waiting;
        workflow.claimed_by = None;
        workflow.claimed_at = None;
        workflow.lease_expires_at = None;
        debug!(
            "workflow waiting for signal: workflow={}, signal={}",
            workflow_id, signal_name
        );
        Ok(SignalWait::Waiting)
    }

    async fn signal_workflow(
        &self,
        workflow_id: Uuid,
        signal_name: &str,
        payload: Value,
    ) -> Result<bool> {
        let woke = {
            let mut state = self.lock();
            let Some(workflow) = state.workflows.get(&workflow_id) else {
                return Ok(false);
            };
            if workflow.is_finished() {
                debug!(
                    "dropping signal for terminal workflow: id={}, signal={}",
                    workflow_id, signal_name
                );
                return Ok(false);
            }

            let waiter = (workflow.status == WorkflowStatus::Waiting)
                .then(|| {
                    state
                        .steps
                        .values()
                        .find(|s| {
                            s.workflow_id == workflow_id
                                && s.status == StepStatus::Running
                                && s.awaiting_signal.as_deref() == Some(signal_name)
                        })
                        .map(|s| s.id)
                })
                .flatten();

            match waiter {
                Some(step_id) => {
                    let step = state.steps.get_mut(&step_id).expect("looked up above");
                    step.status = StepStatus::Completed;
                    step.output = Some(payload);
                    step.awaiting_signal = None;
                    step.completed_at = Some(Utc::now());
                    let workflow = state
                        .workflows
                        .get_mut(&workflow_id)
                        .expect("looked up above");
                    workflow.status = WorkflowStatus::Pending;
                    workflow.claimed_by = None;
                    workflow.claimed_at = None;
                    workflow.lease_expires_at = None;
                    workflow.sleep_until = None;
                    debug!(
                        "signal woke waiting workflow: id={}, signal={}",
                        workflow_id, signal_name
                    );
                    true
                }
                None => {
                    state
                        .workflows
                        .get_mut(&workflow_id)
                        .expect("looked up above")
                        .pending_signals
                        .insert(signal_name.to_string(), payload);
                    debug!(
                        "queued signal: workflow={}, signal={}",
                        workflow_id, signal_name
                    );
                    false
                }
            }
        };
        if woke {
            self.work_notify.notify_one();
        }
        Ok(true)
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        let state = self.lock();
        Ok(state.workflows.get(&workflow_id).cloned())
    }

    async fn list_workflows(
        &self,
        name: Option<&str>,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>> {
        let state = self.lock();
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|w| name.map_or(true, |n| w.name == n))
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        workflows.sort_by_key(|w| w.seq);
        Ok(workflows)
    }

    async fn get_workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>> {
        let state = self.lock();
        let mut steps: Vec<StepRecord> = state
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }

    async fn has_claimable(&self, workflow_names: &[String]) -> Result<bool> {
        let now = Utc::now();
        let state = self.lock();
        let wildcard = is_wildcard(workflow_names);
        Ok(state.workflows.values().any(|w| {
            (wildcard || workflow_names.iter().any(|n| *n == w.name))
                && (w.status == WorkflowStatus::Pending
                    || (w.status == WorkflowStatus::Sleeping
                        && w.sleep_until.is_some_and(|t| t <= now)))
        }))
    }

    fn work_notify(&self) -> &Arc<Notify> {
        &self.work_notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_claim_is_fifo_across_names() {
        let store = InMemoryStore::new();
        store.start_workflow("greet", json!({"o": 1})).await.unwrap();
        store.start_workflow("order", json!({"o": 2})).await.unwrap();
        store.start_workflow("greet", json!({"o": 3})).await.unwrap();
        store.start_workflow("order", json!({"o": 4})).await.unwrap();

        for expected in 1..=4 {
            let claimed = store
                .claim(&names(&["greet", "order"]), "w1")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.input["o"], expected);
            store
                .complete_workflow(claimed.workflow_id, "w1", json!(null))
                .await
                .unwrap();
        }
        assert!(store.claim(&names(&["*"]), "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_sets_lease_fields() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        let claimed = store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        assert_eq!(claimed.workflow_id, id);

        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
        assert_eq!(workflow.claimed_by.as_deref(), Some("w1"));
        assert!(workflow.claimed_at.is_some());
        assert!(workflow.lease_expires_at.unwrap() > Utc::now());
        assert!(workflow.sleep_until.is_none());
    }

    #[tokio::test]
    async fn test_claim_filters_by_name() {
        let store = InMemoryStore::new();
        store.start_workflow("greet", json!({})).await.unwrap();
        assert!(store
            .claim(&names(&["order"]), "w1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim(&names(&["greet"]), "w1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_requires_ownership() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();

        assert!(store.heartbeat(id, "w1").await.unwrap());
        assert!(!store.heartbeat(id, "w2").await.unwrap());
        assert!(!store.heartbeat(Uuid::new_v4(), "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_step_memoization() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();

        let first = store.get_or_create_step(id, "hi", "w1").await.unwrap();
        assert!(first.is_new);
        assert!(store
            .complete_step(first.step_id, "w1", json!("Hello, W!"))
            .await
            .unwrap());

        // Any number of re-resolutions observe the same settled step.
        for _ in 0..3 {
            let replay = store.get_or_create_step(id, "hi", "w1").await.unwrap();
            assert!(!replay.is_new);
            assert_eq!(replay.step_id, first.step_id);
            assert_eq!(replay.status, StepStatus::Completed);
            assert_eq!(replay.output, Some(json!("Hello, W!")));
        }
    }

    #[tokio::test]
    async fn test_get_or_create_step_requires_running_claim() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();

        // Not claimed at all.
        assert!(matches!(
            store.get_or_create_step(id, "hi", "w1").await,
            Err(StorageError::NotClaimOwner { .. })
        ));

        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        assert!(matches!(
            store.get_or_create_step(id, "hi", "w2").await,
            Err(StorageError::NotClaimOwner { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_step_rejects_second_completion() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();

        let step = store.get_or_create_step(id, "hi", "w1").await.unwrap();
        assert!(store
            .complete_step(step.step_id, "w1", json!(1))
            .await
            .unwrap());
        assert!(!store
            .complete_step(step.step_id, "w1", json!(2))
            .await
            .unwrap());
        assert!(!store.fail_step(step.step_id, "w1", "late").await.unwrap());
    }

    #[tokio::test]
    async fn test_step_writes_rejected_after_claim_moves() {
        let store = InMemoryStore::with_claim_timeout(Duration::from_millis(20));
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let step = store.get_or_create_step(id, "hi", "w1").await.unwrap();

        // Lease expires; another worker takes over.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let stolen = store.claim(&names(&["*"]), "w2").await.unwrap().unwrap();
        assert_eq!(stolen.workflow_id, id);

        assert!(!store.heartbeat(id, "w1").await.unwrap());
        assert!(!store
            .complete_step(step.step_id, "w1", json!(1))
            .await
            .unwrap());
        assert!(!store.complete_workflow(id, "w1", json!(1)).await.unwrap());
        assert!(!store.fail_workflow(id, "w1", "boom").await.unwrap());
        assert!(!store
            .schedule_sleep(id, step.step_id, "w1", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_reclaim_preserves_steps() {
        let store = InMemoryStore::with_claim_timeout(Duration::from_millis(20));
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let step_a = store.get_or_create_step(id, "a", "w1").await.unwrap();
        store
            .complete_step(step_a.step_id, "w1", json!("done"))
            .await
            .unwrap();
        store.get_or_create_step(id, "b", "w1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let reclaimed = store.claim(&names(&["*"]), "w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.workflow_id, id);

        // Replay under the new owner: step a is settled, step b is in flight.
        let a = store.get_or_create_step(id, "a", "w2").await.unwrap();
        assert!(!a.is_new);
        assert_eq!(a.status, StepStatus::Completed);
        let b = store.get_or_create_step(id, "b", "w2").await.unwrap();
        assert!(!b.is_new);
        assert_eq!(b.status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_due_sleeper_beats_expired_lease() {
        let store = InMemoryStore::with_claim_timeout(Duration::from_millis(20));

        // An old workflow whose lease will expire while holding the claim.
        let expired_id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();

        // A younger workflow put to sleep with an imminent wake.
        let sleeper_id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w2").await.unwrap().unwrap();
        let marker = store
            .get_or_create_step(sleeper_id, "__sleep:d", "w2")
            .await
            .unwrap();
        store
            .schedule_sleep(
                sleeper_id,
                marker.step_id,
                "w2",
                Utc::now() + chrono::Duration::milliseconds(30),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both are claimable; the due sleeper wins despite being younger.
        let first = store.claim(&names(&["*"]), "w3").await.unwrap().unwrap();
        assert_eq!(first.workflow_id, sleeper_id);
        let second = store.claim(&names(&["*"]), "w3").await.unwrap().unwrap();
        assert_eq!(second.workflow_id, expired_id);
    }

    #[tokio::test]
    async fn test_sleeping_workflow_not_claimable_before_wake() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let marker = store
            .get_or_create_step(id, "__sleep:d", "w1")
            .await
            .unwrap();
        store
            .schedule_sleep(
                id,
                marker.step_id,
                "w1",
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Sleeping);
        assert!(workflow.claimed_by.is_none());
        assert!(store.claim(&names(&["*"]), "w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_claimed_at_reclaim() {
        let store = InMemoryStore::with_claim_timeout(Duration::from_millis(20));
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();

        // Simulate a row written before leases existed.
        {
            let mut state = store.lock();
            let workflow = state.workflows.get_mut(&id).unwrap();
            workflow.lease_expires_at = None;
            workflow.claimed_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }

        let reclaimed = store.claim(&names(&["*"]), "w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.workflow_id, id);
        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.claimed_by.as_deref(), Some("w2"));
        assert!(workflow.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_schedule_sleep_past_wake_returns_false() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let marker = store
            .get_or_create_step(id, "__sleep:d", "w1")
            .await
            .unwrap();

        let scheduled = store
            .schedule_sleep(
                id,
                marker.step_id,
                "w1",
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert!(!scheduled);
        // The workflow stayed running; the caller completes the marker.
        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_schedule_sleep_prefers_existing_marker_time() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let marker = store
            .get_or_create_step(id, "__sleep:d", "w1")
            .await
            .unwrap();
        let original_wake = Utc::now() + chrono::Duration::hours(1);
        store
            .schedule_sleep(id, marker.step_id, "w1", original_wake)
            .await
            .unwrap();

        // A replaying worker reclaims and asks for a different wake time;
        // the marker's original time sticks.
        {
            let mut state = store.lock();
            let workflow = state.workflows.get_mut(&id).unwrap();
            workflow.status = WorkflowStatus::Running;
            workflow.claimed_by = Some("w2".to_string());
            workflow.claimed_at = Some(Utc::now());
            workflow.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(30));
        }
        store
            .schedule_sleep(
                id,
                marker.step_id,
                "w2",
                Utc::now() + chrono::Duration::hours(2),
            )
            .await
            .unwrap();

        let replay = store.get_or_create_step(id, "__sleep:d", "w2").await;
        // The workflow transitioned to sleeping again, so resolution fails
        // the ownership guard; read the record directly instead.
        assert!(replay.is_err());
        let steps = store.get_workflow_steps(id).await.unwrap();
        assert_eq!(steps[0].sleep_until, Some(original_wake));
    }

    #[tokio::test]
    async fn test_direct_sleep_workflow_transition() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("greet", json!({})).await.unwrap();

        // Only the claim owner can park the workflow.
        assert!(!store
            .sleep_workflow(id, "w1", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap());

        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        assert!(store
            .sleep_workflow(id, "w1", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap());
        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Sleeping);
        assert!(workflow.claimed_by.is_none());
        assert!(workflow.sleep_until.is_some());
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_consumed_inline() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("approval", json!({})).await.unwrap();
        assert!(store
            .signal_workflow(id, "approved", json!({"ok": true}))
            .await
            .unwrap());

        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let marker = store
            .get_or_create_step(id, "__signal:approved:d", "w1")
            .await
            .unwrap();
        match store
            .wait_for_signal(id, marker.step_id, "w1", "approved")
            .await
            .unwrap()
        {
            SignalWait::Signaled(payload) => assert_eq!(payload, json!({"ok": true})),
            SignalWait::Waiting => panic!("queued signal should be consumed inline"),
        }
        // The workflow never left Running.
        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_signal_wakes_waiting_workflow() {
        let store = InMemoryStore::new();
        let id = store.start_workflow("approval", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        let marker = store
            .get_or_create_step(id, "__signal:approved:d", "w1")
            .await
            .unwrap();
        assert!(matches!(
            store
                .wait_for_signal(id, marker.step_id, "w1", "approved")
                .await
                .unwrap(),
            SignalWait::Waiting
        ));
        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Waiting);

        assert!(store
            .signal_workflow(id, "approved", json!({"ok": true}))
            .await
            .unwrap());

        // Marker completed with the payload; workflow back in the queue.
        let workflow = store.get_workflow(id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Pending);
        let steps = store.get_workflow_steps(id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].output, Some(json!({"ok": true})));

        // Reclaim and replay: the marker serves its memoized payload.
        store.claim(&names(&["*"]), "w2").await.unwrap().unwrap();
        let replay = store
            .get_or_create_step(id, "__signal:approved:d", "w2")
            .await
            .unwrap();
        assert!(!replay.is_new);
        assert_eq!(replay.output, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_signal_for_unknown_or_finished_workflow() {
        let store = InMemoryStore::new();
        assert!(!store
            .signal_workflow(Uuid::new_v4(), "approved", json!(null))
            .await
            .unwrap());

        let id = store.start_workflow("approval", json!({})).await.unwrap();
        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        store.complete_workflow(id, "w1", json!(null)).await.unwrap();
        assert!(!store
            .signal_workflow(id, "approved", json!(null))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_has_claimable() {
        let store = InMemoryStore::new();
        assert!(!store.has_claimable(&names(&["*"])).await.unwrap());

        let id = store.start_workflow("greet", json!({})).await.unwrap();
        assert!(store.has_claimable(&names(&["*"])).await.unwrap());
        assert!(store.has_claimable(&names(&["greet"])).await.unwrap());
        assert!(!store.has_claimable(&names(&["order"])).await.unwrap());

        store.claim(&names(&["*"]), "w1").await.unwrap().unwrap();
        assert!(!store.has_claimable(&names(&["*"])).await.unwrap());

        // A due sleeper counts as claimable work.
        let marker = store
            .get_or_create_step(id, "__sleep:d", "w1")
            .await
            .unwrap();
        store
            .schedule_sleep(
                id,
                marker.step_id,
                "w1",
                Utc::now() + chrono::Duration::milliseconds(10),
            )
            .await
            .unwrap();
        assert!(!store.has_claimable(&names(&["*"])).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.has_claimable(&names(&["*"])).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_workflows_filters() {
        let store = InMemoryStore::new();
        store.start_workflow("greet", json!({})).await.unwrap();
        store.start_workflow("order", json!({})).await.unwrap();
        store.claim(&names(&["order"]), "w1").await.unwrap().unwrap();

        assert_eq!(store.list_workflows(None, None).await.unwrap().len(), 2);
        assert_eq!(
            store
                .list_workflows(Some("greet"), None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .list_workflows(None, Some(WorkflowStatus::Running))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
