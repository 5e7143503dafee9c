use super::error::{ExecutionError, Result, SuspendReason};
use crate::core::{
    deserialize_value, is_reserved_step_name, serialize_value, signal_step_name, sleep_step_name,
    SignalWait, StepStatus,
};
use crate::storage::OrchestratorStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A boxed error that can be sent across threads.
///
/// This is the standard error type used throughout async Rust ecosystems;
/// any error implementing `std::error::Error` converts into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The handle a workflow function uses to interact with the engine.
///
/// Every operation here is memoized by name or marker against the store, so
/// the function can be re-entered from the top on each claim and observe the
/// same results it observed before. Determinism outside these operations is
/// the workflow author's responsibility: markers must be replay-stable and
/// must not depend on non-replayable values.
pub struct WorkflowContext<S> {
    workflow_id: Uuid,
    worker_id: String,
    input: Value,
    store: Arc<S>,
    /// Set by the heartbeater when the store reports the claim has moved.
    claim_lost: Arc<AtomicBool>,
    /// Name of the step whose activity is currently executing, if any.
    /// Guards against suspension primitives nested inside a step: the outer
    /// step's memoization would mask the marker's state on replay.
    executing_step: Arc<Mutex<Option<String>>>,
}

impl<S> Clone for WorkflowContext<S> {
    fn clone(&self) -> Self {
        Self {
            workflow_id: self.workflow_id,
            worker_id: self.worker_id.clone(),
            input: self.input.clone(),
            store: Arc::clone(&self.store),
            claim_lost: Arc::clone(&self.claim_lost),
            executing_step: Arc::clone(&self.executing_step),
        }
    }
}

impl<S: OrchestratorStore> WorkflowContext<S> {
    pub(crate) fn new(
        workflow_id: Uuid,
        worker_id: String,
        input: Value,
        store: Arc<S>,
        claim_lost: Arc<AtomicBool>,
    ) -> Self {
        Self {
            workflow_id,
            worker_id,
            input,
            store,
            claim_lost,
            executing_step: Arc::new(Mutex::new(None)),
        }
    }

    /// The workflow's id.
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// The id of the worker currently executing this claim.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The workflow's input as raw JSON.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// The workflow's input decoded into a typed value.
    pub fn typed_input<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(deserialize_value(&self.input)?)
    }

    fn check_claim(&self) -> Result<()> {
        if self.claim_lost.load(Ordering::SeqCst) {
            return Err(ExecutionError::ClaimLost);
        }
        Ok(())
    }

    fn executing_step_name(&self) -> Option<String> {
        self.executing_step.lock().expect("step guard poisoned").clone()
    }

    fn set_executing_step(&self, name: Option<String>) {
        *self.executing_step.lock().expect("step guard poisoned") = name;
    }

    /// Runs a named, memoized step.
    ///
    /// On first execution the activity `f` runs and its result is durably
    /// recorded; on every replay the recorded result is returned without
    /// invoking `f`. A previously failed step rethrows its stored error.
    /// If a prior worker crashed mid-step, the step is re-executed: commits
    /// are at-most-once, the activity itself is at-least-once.
    pub async fn step<T, E, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Into<BoxError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.check_claim()?;
        if is_reserved_step_name(name) {
            return Err(ExecutionError::Contract(format!(
                "step name '{name}' uses a reserved marker prefix"
            )));
        }

        let snapshot = self
            .store
            .get_or_create_step(self.workflow_id, name, &self.worker_id)
            .await?;

        match snapshot.status {
            StepStatus::Completed => {
                debug!("step '{}' replayed from stored output", name);
                let output = snapshot.output.unwrap_or(Value::Null);
                return Ok(deserialize_value(&output)?);
            }
            StepStatus::Failed => {
                return Err(ExecutionError::StepFailed {
                    step: name.to_string(),
                    message: snapshot.error.unwrap_or_default(),
                });
            }
            // A running step that is not new was in flight when a previous
            // worker died; execute it again.
            StepStatus::Pending | StepStatus::Running => {}
        }

        self.set_executing_step(Some(name.to_string()));
        let result = f().await;
        self.set_executing_step(None);

        match result {
            Ok(value) => {
                let output = serialize_value(&value)?;
                if !self
                    .store
                    .complete_step(snapshot.step_id, &self.worker_id, output)
                    .await?
                {
                    return Err(ExecutionError::ClaimLost);
                }
                Ok(value)
            }
            Err(e) => {
                let message = e.into().to_string();
                // Best effort: if the claim moved we cannot record the
                // failure, but the error still propagates locally.
                match self
                    .store
                    .fail_step(snapshot.step_id, &self.worker_id, &message)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!("step '{}' failure not recorded: claim moved", name),
                    Err(e) => warn!("step '{}' failure not recorded: {}", name, e),
                }
                Err(ExecutionError::StepFailed {
                    step: name.to_string(),
                    message,
                })
            }
        }
    }

    /// Durably sleeps for `duration` under a replay-stable marker.
    pub async fn sleep(&self, marker: &str, duration: Duration) -> Result<()> {
        let wake_at = Utc::now()
            + chrono::Duration::from_std(duration)
                .map_err(|e| ExecutionError::Contract(format!("invalid sleep duration: {e}")))?;
        self.sleep_until(marker, wake_at).await
    }

    /// Durably sleeps until `wake_at` under a replay-stable marker.
    ///
    /// On first execution this persists a wake time and suspends the
    /// workflow; on replay after the wake time the marker is observed
    /// completed and the call returns immediately. A wake time already in
    /// the past on first entry is a warned no-op.
    pub async fn sleep_until(&self, marker: &str, wake_at: DateTime<Utc>) -> Result<()> {
        if let Some(step) = self.executing_step_name() {
            return Err(ExecutionError::Contract(format!(
                "ctx.sleep cannot be called inside ctx.step (step '{step}')"
            )));
        }
        if marker.is_empty() {
            return Err(ExecutionError::Contract(
                "ctx.sleep requires a non-empty marker".to_string(),
            ));
        }
        self.check_claim()?;

        let now = Utc::now();
        if wake_at <= now {
            warn!(
                "sleep '{}' requested a wake time in the past; continuing without sleeping",
                marker
            );
            return Ok(());
        }

        let step_name = sleep_step_name(marker);
        let snapshot = self
            .store
            .get_or_create_step(self.workflow_id, &step_name, &self.worker_id)
            .await?;

        match snapshot.status {
            StepStatus::Completed => return Ok(()),
            StepStatus::Failed => {
                return Err(ExecutionError::StepFailed {
                    step: step_name,
                    message: snapshot.error.unwrap_or_default(),
                });
            }
            StepStatus::Pending | StepStatus::Running => {}
        }

        // The marker's stored wake time wins over the caller's, so the
        // observed sleep is identical on every replay.
        let wake_at = snapshot.sleep_until.unwrap_or(wake_at);
        if wake_at <= Utc::now() {
            // Woken up after an outage longer than the sleep itself.
            return self
                .finish_sleep_marker(snapshot.step_id, &step_name, wake_at)
                .await;
        }

        if self
            .store
            .schedule_sleep(self.workflow_id, snapshot.step_id, &self.worker_id, wake_at)
            .await?
        {
            debug!("workflow sleeping until {}: marker='{}'", wake_at, marker);
            return Err(ExecutionError::Suspended(SuspendReason::Sleep { wake_at }));
        }

        // The store declined to transition: either the wake time slipped
        // into the past, or the claim moved. Completing the marker settles
        // which, because completion is ownership-guarded too.
        self.finish_sleep_marker(snapshot.step_id, &step_name, wake_at)
            .await
    }

    async fn finish_sleep_marker(
        &self,
        step_id: Uuid,
        step_name: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<()> {
        if !self
            .store
            .complete_step(step_id, &self.worker_id, json!({ "sleep_until": wake_at }))
            .await?
        {
            return Err(ExecutionError::ClaimLost);
        }
        debug!("sleep marker '{}' already due; continuing", step_name);
        Ok(())
    }

    /// Durably waits for the named signal under a replay-stable marker,
    /// returning the signal payload.
    ///
    /// If the signal arrived before this point it is consumed immediately;
    /// otherwise the workflow suspends and a later `signal_workflow` call
    /// completes the marker and re-queues the workflow for claiming.
    pub async fn wait_for_signal(&self, marker: &str, signal_name: &str) -> Result<Value> {
        if let Some(step) = self.executing_step_name() {
            return Err(ExecutionError::Contract(format!(
                "ctx.wait_for_signal cannot be called inside ctx.step (step '{step}')"
            )));
        }
        if marker.is_empty() {
            return Err(ExecutionError::Contract(
                "ctx.wait_for_signal requires a non-empty marker".to_string(),
            ));
        }
        if signal_name.is_empty() {
            return Err(ExecutionError::Contract(
                "ctx.wait_for_signal requires a non-empty signal name".to_string(),
            ));
        }
        self.check_claim()?;

        let step_name = signal_step_name(signal_name, marker);
        let snapshot = self
            .store
            .get_or_create_step(self.workflow_id, &step_name, &self.worker_id)
            .await?;

        match snapshot.status {
            StepStatus::Completed => {
                debug!("signal wait '{}' replayed from stored payload", step_name);
                return Ok(snapshot.output.unwrap_or(Value::Null));
            }
            StepStatus::Failed => {
                return Err(ExecutionError::StepFailed {
                    step: step_name,
                    message: snapshot.error.unwrap_or_default(),
                });
            }
            StepStatus::Pending | StepStatus::Running => {}
        }

        match self
            .store
            .wait_for_signal(
                self.workflow_id,
                snapshot.step_id,
                &self.worker_id,
                signal_name,
            )
            .await?
        {
            SignalWait::Signaled(payload) => {
                if !self
                    .store
                    .complete_step(snapshot.step_id, &self.worker_id, payload.clone())
                    .await?
                {
                    return Err(ExecutionError::ClaimLost);
                }
                debug!("signal '{}' was already queued; continuing", signal_name);
                Ok(payload)
            }
            SignalWait::Waiting => {
                debug!("workflow waiting for signal '{}'", signal_name);
                Err(ExecutionError::Suspended(SuspendReason::Signal {
                    signal_name: signal_name.to_string(),
                    marker: marker.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkflowStatus;
    use crate::storage::InMemoryStore;
    use std::sync::atomic::AtomicU32;

    async fn claimed_ctx(
        store: &Arc<InMemoryStore>,
        name: &str,
        worker_id: &str,
    ) -> WorkflowContext<InMemoryStore> {
        let workflow_id = store.start_workflow(name, json!({})).await.unwrap();
        let claimed = store
            .claim(&[crate::storage::CLAIM_ALL.to_string()], worker_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.workflow_id, workflow_id);
        WorkflowContext::new(
            workflow_id,
            worker_id.to_string(),
            claimed.input,
            Arc::clone(store),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_step_executes_once_and_replays() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let greeting: String = ctx
                .step("hi", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("Hello, W!".to_string())
                })
                .await
                .unwrap();
            assert_eq!(greeting, "Hello, W!");
        }
        // Activity invoked exactly once; replays served from the store.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_step_rethrows_stored_error() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;

        let err = ctx
            .step("broken", || async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::StepFailed { .. }));

        // Replay does not re-run the activity; the stored error rethrows.
        let err = ctx
            .step::<(), String, _, _>("broken", || async {
                panic!("activity must not re-run")
            })
            .await
            .unwrap_err();
        match err {
            ExecutionError::StepFailed { step, message } => {
                assert_eq!(step, "broken");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reserved_step_names_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;
        let err = ctx
            .step("__sleep:sneaky", || async { Ok::<_, String>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Contract(_)));
    }

    #[tokio::test]
    async fn test_sleep_inside_step_fails_step_and_never_schedules() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;
        let workflow_id = ctx.workflow_id();

        let inner = ctx.clone();
        let err = ctx
            .step("bad", move || async move {
                inner.sleep("x", Duration::from_secs(1)).await?;
                Ok::<_, ExecutionError>(())
            })
            .await
            .unwrap_err();

        match err {
            ExecutionError::StepFailed { step, message } => {
                assert_eq!(step, "bad");
                assert!(message.contains("cannot be called inside ctx.step"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // No sleep transition happened and the step is durably failed.
        let workflow = store.get_workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
        let steps = store.get_workflow_steps(workflow_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "bad");
        assert_eq!(steps[0].status, crate::core::StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_sleep_suspends_then_replays_to_completion() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;
        let workflow_id = ctx.workflow_id();

        let err = ctx
            .sleep("d", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Suspended(SuspendReason::Sleep { .. })
        ));
        let workflow = store.get_workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Sleeping);
        assert!(workflow.sleep_until.is_some());

        // Wake time passes; another worker reclaims and replays.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let claimed = store
            .claim(&["*".to_string()], "w2")
            .await
            .unwrap()
            .unwrap();
        let ctx2 = WorkflowContext::new(
            workflow_id,
            "w2".to_string(),
            claimed.input,
            Arc::clone(&store),
            Arc::new(AtomicBool::new(false)),
        );
        // The marker is now due: the replayed sleep completes it and returns.
        ctx2.sleep("d", Duration::from_millis(30)).await.unwrap();

        let steps = store.get_workflow_steps(workflow_id).await.unwrap();
        assert_eq!(steps[0].name, "__sleep:d");
        assert_eq!(steps[0].status, crate::core::StepStatus::Completed);

        // A third replay observes the completed marker immediately.
        ctx2.sleep("d", Duration::from_millis(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sleep_in_the_past_is_a_noop() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;

        ctx.sleep_until("late", Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap();
        // No marker row was created.
        let steps = store.get_workflow_steps(ctx.workflow_id()).await.unwrap();
        assert!(steps.is_empty());
    }

    #[tokio::test]
    async fn test_sleep_requires_marker() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;
        let err = ctx.sleep("", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Contract(_)));
    }

    #[tokio::test]
    async fn test_wait_for_signal_pre_arrival() {
        let store = Arc::new(InMemoryStore::new());
        let workflow_id = store.start_workflow("approval", json!({})).await.unwrap();
        store
            .signal_workflow(workflow_id, "approved", json!({"ok": true}))
            .await
            .unwrap();

        let claimed = store
            .claim(&["*".to_string()], "w1")
            .await
            .unwrap()
            .unwrap();
        let ctx = WorkflowContext::new(
            workflow_id,
            "w1".to_string(),
            claimed.input,
            Arc::clone(&store),
            Arc::new(AtomicBool::new(false)),
        );

        let payload = ctx.wait_for_signal("d", "approved").await.unwrap();
        assert_eq!(payload, json!({"ok": true}));
        // The workflow never transitioned to waiting.
        let workflow = store.get_workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_wait_for_signal_suspends_then_replays_payload() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "approval", "w1").await;
        let workflow_id = ctx.workflow_id();

        let err = ctx.wait_for_signal("d", "approved").await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Suspended(SuspendReason::Signal { .. })
        ));

        store
            .signal_workflow(workflow_id, "approved", json!({"ok": 1}))
            .await
            .unwrap();

        let claimed = store
            .claim(&["*".to_string()], "w2")
            .await
            .unwrap()
            .unwrap();
        let ctx2 = WorkflowContext::new(
            workflow_id,
            "w2".to_string(),
            claimed.input,
            Arc::clone(&store),
            Arc::new(AtomicBool::new(false)),
        );
        let payload = ctx2.wait_for_signal("d", "approved").await.unwrap();
        assert_eq!(payload, json!({"ok": 1}));
    }

    #[tokio::test]
    async fn test_claim_lost_flag_stops_all_operations() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = claimed_ctx(&store, "greet", "w1").await;
        ctx.claim_lost.store(true, Ordering::SeqCst);

        assert!(matches!(
            ctx.step("hi", || async { Ok::<_, String>(1) }).await,
            Err(ExecutionError::ClaimLost)
        ));
        assert!(matches!(
            ctx.sleep("d", Duration::from_secs(1)).await,
            Err(ExecutionError::ClaimLost)
        ));
        assert!(matches!(
            ctx.wait_for_signal("d", "approved").await,
            Err(ExecutionError::ClaimLost)
        ));
    }
}
