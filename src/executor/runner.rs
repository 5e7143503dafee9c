use super::context::WorkflowContext;
use super::error::ExecutionError;
use super::worker::WorkflowFn;
use crate::core::ClaimedWorkflow;
use crate::storage::OrchestratorStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a worker extends the lease on each claim it holds.
///
/// Three heartbeats fit inside one claim timeout, so a single dropped
/// heartbeat never costs a healthy worker its claim.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Executes one claimed workflow to its next stopping point: completion,
/// failure, suspension, or a lost claim.
///
/// The user function is re-entered from the top; completed steps replay from
/// the store, so only not-yet-finished work actually runs.
pub(crate) async fn run_claimed<S>(
    store: Arc<S>,
    worker_id: String,
    claimed: ClaimedWorkflow,
    func: WorkflowFn<S>,
) where
    S: OrchestratorStore + 'static,
{
    let workflow_id = claimed.workflow_id;
    let claim_lost = Arc::new(AtomicBool::new(false));
    let heartbeater = spawn_heartbeater(
        Arc::clone(&store),
        workflow_id,
        worker_id.clone(),
        Arc::clone(&claim_lost),
    );

    let ctx = WorkflowContext::new(
        workflow_id,
        worker_id.clone(),
        claimed.input,
        Arc::clone(&store),
        Arc::clone(&claim_lost),
    );

    match func(ctx).await {
        Ok(output) => {
            if claim_lost.load(Ordering::SeqCst) {
                info!(
                    "workflow {} finished locally but the claim moved; discarding result",
                    workflow_id
                );
            } else {
                match store.complete_workflow(workflow_id, &worker_id, output).await {
                    Ok(true) => info!("workflow {} completed", workflow_id),
                    Ok(false) => info!(
                        "workflow {} completion rejected: claim moved",
                        workflow_id
                    ),
                    Err(e) => error!("failed to record completion of {}: {}", workflow_id, e),
                }
            }
        }
        // Not failures: the store already holds the suspended state.
        Err(ExecutionError::Suspended(reason)) => {
            debug!("workflow {} suspended: {:?}", workflow_id, reason);
        }
        Err(ExecutionError::ClaimLost) => {
            info!("workflow {} execution stopped: claim lost", workflow_id);
        }
        Err(e) => {
            if claim_lost.load(Ordering::SeqCst) {
                info!(
                    "workflow {} failed locally after losing its claim; suppressing",
                    workflow_id
                );
            } else {
                let message = e.to_string();
                match store.fail_workflow(workflow_id, &worker_id, &message).await {
                    Ok(true) => warn!("workflow {} failed: {}", workflow_id, message),
                    Ok(false) => info!("workflow {} failure rejected: claim moved", workflow_id),
                    Err(e) => error!("failed to record failure of {}: {}", workflow_id, e),
                }
            }
        }
    }

    heartbeater.abort();
}

/// Periodically extends the lease. A false return from the store is the
/// authoritative "the claim moved" signal; transport errors are treated as
/// transient and retried on the next tick.
fn spawn_heartbeater<S>(
    store: Arc<S>,
    workflow_id: Uuid,
    worker_id: String,
    claim_lost: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    S: OrchestratorStore + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut interval = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match store.heartbeat(workflow_id, &worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "heartbeat rejected for workflow {}: claim moved to another worker",
                        workflow_id
                    );
                    claim_lost.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    warn!(
                        "heartbeat for workflow {} failed (will retry): {}",
                        workflow_id, e
                    );
                }
            }
        }
    })
}
