//! Pull-based worker: claim loop, definition registry, and lifecycle handle.
//!
//! Workers poll the store for claimable workflows, dispatch each claim into
//! an execution slot, and keep at most `max_concurrent_workflows` slots in
//! flight. A reactive wakeup from the store's notify handle shortcuts the
//! poll interval; the timer remains the correctness fallback.

use super::context::WorkflowContext;
use super::error::{ExecutionError, Result as ExecutionResult};
use super::runner::run_claimed;
use crate::core::serialize_value;
use crate::storage::{OrchestratorStore, CLAIM_ALL};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default cadence of the fallback claim poll.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Default number of concurrent execution slots per worker.
const DEFAULT_MAX_CONCURRENT_WORKFLOWS: usize = 1;

/// Type-erased workflow function.
///
/// Registered functions are wrapped so the claim loop can dispatch any
/// workflow type through one signature: context in, JSON output out.
pub(crate) type WorkflowFn<S> = Arc<
    dyn Fn(WorkflowContext<S>) -> Pin<Box<dyn Future<Output = ExecutionResult<Value>> + Send>>
        + Send
        + Sync,
>;

/// Registry mapping workflow names to their functions.
pub struct Registry<S> {
    funcs: HashMap<String, WorkflowFn<S>>,
}

impl<S: OrchestratorStore + 'static> Registry<S> {
    pub fn new() -> Self {
        Self {
            funcs: HashMap::new(),
        }
    }

    /// Registers a workflow definition under `name`.
    ///
    /// The function receives a [`WorkflowContext`] and returns any
    /// serializable value, which becomes the workflow's recorded output.
    pub fn register<F, Fut, R>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let name = name.into();
        let boxed: WorkflowFn<S> = Arc::new(move |ctx| {
            let fut = f(ctx);
            Box::pin(async move {
                let value = fut.await?;
                serialize_value(&value).map_err(ExecutionError::from)
            })
        });
        debug!("registered workflow definition: {}", name);
        self.funcs.insert(name, boxed);
    }

    fn get(&self, name: &str) -> Option<WorkflowFn<S>> {
        self.funcs.get(name).cloned()
    }

    /// Names of all registered definitions, the claim filter for workers
    /// that do not claim the wildcard.
    pub fn names(&self) -> Vec<String> {
        self.funcs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl<S: OrchestratorStore + 'static> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A pull-based workflow worker.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use telos::storage::InMemoryStore;
/// use telos::executor::Worker;
///
/// # async fn example() {
/// let store = Arc::new(InMemoryStore::new());
/// let worker = Worker::new(Arc::clone(&store))
///     .with_poll_interval(Duration::from_millis(250))
///     .with_max_concurrent_workflows(4);
///
/// worker
///     .register("greet", |ctx| async move {
///         let name: String = ctx.step("load-name", || async { Ok::<_, String>("W".to_string()) }).await?;
///         Ok(serde_json::json!({ "greeting": format!("Hello, {name}!") }))
///     })
///     .await;
///
/// let handle = worker.start();
/// // ... later:
/// handle.shutdown().await;
/// # }
/// ```
pub struct Worker<S: OrchestratorStore + 'static> {
    store: Arc<S>,
    worker_id: String,
    registry: Arc<RwLock<Registry<S>>>,
    poll_interval: Duration,
    max_concurrent_workflows: usize,
    claim_all_workflows: bool,
    work_notify: Arc<Notify>,
}

impl<S: OrchestratorStore + 'static> Worker<S> {
    /// Creates a worker with a generated id and default options.
    pub fn new(store: Arc<S>) -> Self {
        let work_notify = Arc::clone(store.work_notify());
        Self {
            store,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            registry: Arc::new(RwLock::new(Registry::new())),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_concurrent_workflows: DEFAULT_MAX_CONCURRENT_WORKFLOWS,
            claim_all_workflows: false,
            work_notify,
        }
    }

    /// Overrides the generated worker id.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets the fallback poll cadence. Default is 1 second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how many workflow executions may run concurrently on this
    /// worker. Default is 1.
    pub fn with_max_concurrent_workflows(mut self, max: usize) -> Self {
        self.max_concurrent_workflows = max.max(1);
        self
    }

    /// Claims across all workflow names instead of only the registered
    /// ones. Claims whose name has no local definition are dropped and
    /// reclaimed elsewhere once the lease expires.
    pub fn with_claim_all_workflows(mut self) -> Self {
        self.claim_all_workflows = true;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Registers a workflow definition. See [`Registry::register`].
    pub async fn register<F, Fut, R>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.registry.write().await.register(name, f);
    }

    /// Starts the claim loop in the background and returns its handle.
    pub fn start(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let loop_token = cancellation_token.clone();
        let worker_id = self.worker_id.clone();
        info!("starting worker: {}", self.worker_id);

        let handle = tokio::spawn(async move {
            let mut slots: JoinSet<()> = JoinSet::new();

            loop {
                // Fill free execution slots until the store runs dry.
                while slots.len() < self.max_concurrent_workflows {
                    let names = if self.claim_all_workflows {
                        vec![CLAIM_ALL.to_string()]
                    } else {
                        self.registry.read().await.names()
                    };
                    if names.is_empty() {
                        break;
                    }

                    match self.store.claim(&names, &self.worker_id).await {
                        Ok(Some(claimed)) => {
                            let func = self.registry.read().await.get(&claimed.name);
                            match func {
                                Some(func) => {
                                    slots.spawn(run_claimed(
                                        Arc::clone(&self.store),
                                        self.worker_id.clone(),
                                        claimed,
                                        func,
                                    ));
                                }
                                None => {
                                    // The lease expires on its own and the
                                    // workflow becomes reclaimable.
                                    warn!(
                                        "no definition registered for claimed workflow '{}'; dropping claim {}",
                                        claimed.name, claimed.workflow_id
                                    );
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("worker {} failed to claim: {}", self.worker_id, e);
                            break;
                        }
                    }
                }

                tokio::select! {
                    biased;

                    _ = loop_token.cancelled() => {
                        info!("worker {} received shutdown signal", self.worker_id);
                        break;
                    }
                    Some(result) = slots.join_next(), if !slots.is_empty() => {
                        if let Err(e) = result {
                            error!("worker {} execution slot panicked: {}", self.worker_id, e);
                        }
                    }
                    _ = self.work_notify.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }

            // Let in-flight executions finish naturally; they write their
            // results if the claim still holds.
            let in_flight = slots.len();
            if in_flight > 0 {
                info!(
                    "worker {} waiting for {} in-flight workflows",
                    self.worker_id, in_flight
                );
                while slots.join_next().await.is_some() {}
            }
            info!("worker {} stopped", self.worker_id);
        });

        WorkerHandle {
            worker_id,
            handle,
            cancellation_token,
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Requests a graceful shutdown: the claim loop stops taking work and
    /// in-flight executions run to their next stopping point.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await;
    }

    /// Returns true if the claim loop is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the worker immediately. In-flight claims are simply dropped
    /// and become reclaimable when their leases expire; prefer
    /// [`WorkerHandle::shutdown`].
    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_register_and_names() {
        let mut registry: Registry<InMemoryStore> = Registry::new();
        assert!(registry.is_empty());
        registry.register("greet", |_ctx| async move { Ok(json!(null)) });
        registry.register("order", |_ctx| async move { Ok(json!(null)) });
        assert_eq!(registry.len(), 2);
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["greet", "order"]);
        assert!(registry.get("greet").is_some());
        assert!(registry.get("billing").is_none());
    }

    #[tokio::test]
    async fn test_worker_builder_options() {
        let store = Arc::new(InMemoryStore::new());
        let worker = Worker::new(Arc::clone(&store))
            .with_worker_id("w-test")
            .with_poll_interval(Duration::from_millis(10))
            .with_max_concurrent_workflows(0);
        assert_eq!(worker.worker_id(), "w-test");
        // Concurrency is clamped to at least one slot.
        assert_eq!(worker.max_concurrent_workflows, 1);
    }

    #[tokio::test]
    async fn test_worker_shutdown_is_clean() {
        let store = Arc::new(InMemoryStore::new());
        let worker = Worker::new(store).with_poll_interval(Duration::from_millis(10));
        worker
            .register("noop", |_ctx| async move { Ok(json!(null)) })
            .await;
        let handle = worker.start();
        assert!(handle.is_running());
        handle.shutdown().await;
    }
}
