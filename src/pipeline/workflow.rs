//! Workflow activation pipeline.
//!
//! Activations are grouped by `run_id`. A group applies activations to its
//! run strictly serially, holding `Option<WorkflowHandle>` across steps;
//! the handle owns a sandbox slot for the life of the run. Completions are
//! submitted from inside the group, so submission order per run equals
//! activation order. A rejected completion (`WorkflowError`) feeds a
//! synthetic eviction back into the dispatcher instead of failing the
//! worker.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, WorkerBridge};
use crate::config::WorkerConfig;
use crate::convert::DataConverter;
use crate::errors::{IllegalStateError, WorkerError};
use crate::lifecycle::{FatalSink, LifecycleController};
use crate::messages::{
    decode_framed, encode_message, eviction_activation, failed_activation_completion,
    failure_from_error, frame_bytes, job_label,
};
use crate::pipeline::{GroupClosed, GroupTable, WorkerGauges, GROUP_CHANNEL_CAPACITY};
use crate::proto::{
    workflow_activation_job, StartWorkflow, WorkflowActivation, WorkflowActivationJob,
};
use crate::sandbox::{Sandbox, SandboxError, SandboxPool, SandboxOptions, SlotPermit, WorkflowInfo};

/// Shared dependencies of the workflow pipeline.
pub(crate) struct WorkflowPipelineCtx {
    pub bridge: Arc<dyn WorkerBridge>,
    pub pool: Arc<SandboxPool>,
    pub converter: Arc<dyn DataConverter>,
    pub config: Arc<WorkerConfig>,
    pub gauges: Arc<WorkerGauges>,
    pub fatal: FatalSink,
    pub lifecycle: Arc<LifecycleController>,
    pub exec_semaphore: Arc<Semaphore>,
    pub feedback_tx: mpsc::UnboundedSender<WorkflowActivation>,
    pub closed_tx: mpsc::UnboundedSender<GroupClosed>,
}

/// One live workflow run: its sandbox, the slot the sandbox occupies, and
/// a log of the jobs it has seen (for error correlation).
pub(crate) struct WorkflowHandle {
    run_id: String,
    sandbox: Sandbox,
    job_log: Vec<&'static str>,
    _slot: SlotPermit,
}

impl WorkflowHandle {
    async fn activate(
        &mut self,
        activation: &WorkflowActivation,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>, SandboxError> {
        for job in &activation.jobs {
            self.job_log.push(job_label(job));
        }
        self.sandbox.activate(activation, timeout).await
    }

    fn dispose(self) {
        debug!(
            run_id = %self.run_id,
            jobs_applied = self.job_log.len(),
            "workflow handle disposed"
        );
        self.sandbox.dispose();
    }
}

pub(crate) fn spawn_workflow_pipeline(
    ctx: Arc<WorkflowPipelineCtx>,
    poll_rx: mpsc::Receiver<Vec<u8>>,
    feedback_rx: mpsc::UnboundedReceiver<WorkflowActivation>,
    closed_rx: mpsc::UnboundedReceiver<GroupClosed>,
    sweep_rx: mpsc::UnboundedReceiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(dispatch_loop(ctx, poll_rx, feedback_rx, closed_rx, sweep_rx))
}

async fn dispatch_loop(
    ctx: Arc<WorkflowPipelineCtx>,
    mut poll_rx: mpsc::Receiver<Vec<u8>>,
    mut feedback_rx: mpsc::UnboundedReceiver<WorkflowActivation>,
    mut closed_rx: mpsc::UnboundedReceiver<GroupClosed>,
    mut sweep_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut groups: GroupTable<WorkflowActivation> = GroupTable::default();
    let mut state_rx = ctx.lifecycle.watch();
    let mut polling_done = false;

    loop {
        if polling_done && groups.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            Some(closed) = closed_rx.recv() => {
                groups.remove_closed(&closed);
            }
            Some(()) = sweep_rx.recv() => {
                sweep_groups(&ctx, &mut groups).await;
            }
            Some(activation) = feedback_rx.recv() => {
                route(&ctx, &mut groups, activation).await;
            }
            polled = poll_rx.recv(), if !polling_done => {
                match polled {
                    Some(bytes) => match decode_framed::<WorkflowActivation>(&bytes) {
                        Ok(activation) => route(&ctx, &mut groups, activation).await,
                        Err(err) => {
                            // The activation envelope itself is opaque
                            // garbage; there is no run to fail.
                            ctx.fatal.fail(err.into());
                            break;
                        }
                    },
                    None => {
                        debug!("workflow pollers finished");
                        polling_done = true;
                        // No further activation can ever arrive; runs still
                        // cached at this point would never be evicted.
                        sweep_groups(&ctx, &mut groups).await;
                    }
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() || state_rx.borrow().is_terminal() {
                    break;
                }
            }
            else => break,
        }
    }
    debug!("workflow pipeline closed");
}

/// Evict every still-live run so its sandbox releases cleanly.
async fn sweep_groups(
    ctx: &Arc<WorkflowPipelineCtx>,
    groups: &mut GroupTable<WorkflowActivation>,
) {
    let live = groups.live_keys();
    if live.is_empty() {
        return;
    }
    info!(runs = live.len(), "drain sweep evicting live workflow runs");
    for run_id in live {
        let activation = eviction_activation(&run_id, "worker draining");
        route(ctx, groups, activation).await;
    }
}

/// Bucket one activation into its run group, creating the group if needed.
/// A send into a group that just closed re-creates a fresh group and
/// retries; the in-flight gauge is incremented at group entry.
async fn route(
    ctx: &Arc<WorkflowPipelineCtx>,
    groups: &mut GroupTable<WorkflowActivation>,
    mut activation: WorkflowActivation,
) {
    let run_id = activation.run_id.clone();
    ctx.gauges.activations.increment();
    loop {
        let tx = match groups.get(&run_id) {
            Some(tx) => tx,
            None => {
                let (tx, rx) = mpsc::channel(GROUP_CHANNEL_CAPACITY);
                let generation = groups.insert(run_id.clone(), tx.clone());
                tokio::spawn(run_group(run_id.clone(), generation, rx, Arc::clone(ctx)));
                tx
            }
        };
        match tx.send(activation).await {
            Ok(()) => return,
            Err(send_error) => {
                // Group closed between lookup and send; start fresh.
                activation = send_error.0;
                groups.remove(&run_id);
            }
        }
    }
}

/// Serial per-run processor carrying `Option<WorkflowHandle>` between
/// steps. At most one activation for a run is ever in flight.
async fn run_group(
    run_id: String,
    generation: u64,
    mut rx: mpsc::Receiver<WorkflowActivation>,
    ctx: Arc<WorkflowPipelineCtx>,
) {
    let mut handle: Option<WorkflowHandle> = None;
    while let Some(activation) = rx.recv().await {
        let permit = match Arc::clone(&ctx.exec_semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let step = process_activation(&mut handle, activation, &ctx).await;
        drop(permit);
        match step {
            Ok(outcome) => {
                if let Some(completion) = outcome.completion {
                    submit_completion(&ctx, &run_id, completion).await;
                }
                ctx.gauges.activations.decrement();
                if outcome.close {
                    break;
                }
            }
            Err(error) => {
                ctx.gauges.activations.decrement();
                ctx.fatal.fail(error);
                break;
            }
        }
    }
    if let Some(live) = handle.take() {
        live.dispose();
        ctx.gauges.workflows.decrement();
    }
    let _ = ctx.closed_tx.send(GroupClosed {
        key: run_id,
        generation,
    });
}

struct StepOutcome {
    /// Encoded completion to submit, if this activation produces one.
    /// Synthetic eviction-only activations complete silently.
    completion: Option<Vec<u8>>,
    close: bool,
}

/// Apply one activation to the group's run. Invariant violations are
/// returned as errors (fatal); anything that merely invalidates this run
/// becomes a failed completion with `close`.
async fn process_activation(
    handle: &mut Option<WorkflowHandle>,
    activation: WorkflowActivation,
    ctx: &Arc<WorkflowPipelineCtx>,
) -> Result<StepOutcome, WorkerError> {
    let run_id = activation.run_id.clone();
    let timestamp_ms = activation.timestamp_ms;
    let is_replaying = activation.is_replaying;

    let mut evictions = 0usize;
    let mut jobs: Vec<WorkflowActivationJob> = Vec::with_capacity(activation.jobs.len());
    for job in activation.jobs {
        match &job.variant {
            Some(workflow_activation_job::Variant::RemoveFromCache(evict)) => {
                debug!(run_id = %run_id, reason = %evict.message, "eviction requested");
                evictions += 1;
            }
            Some(workflow_activation_job::Variant::NotifyHasChange(change)) => {
                // Contract unspecified upstream; pass through as a no-op.
                debug!(run_id = %run_id, patch_id = %change.patch_id, "notify_has_change (no-op)");
                jobs.push(job);
            }
            _ => jobs.push(job),
        }
    }
    if evictions > 1 {
        return Err(IllegalStateError::new(format!(
            "activation for run {run_id} carries {evictions} eviction jobs"
        ))
        .into());
    }
    let close = evictions == 1;
    if jobs.is_empty() && !close {
        return Err(IllegalStateError::new(format!(
            "activation for run {run_id} has no jobs and no eviction"
        ))
        .into());
    }

    let mut completion = None;
    if !jobs.is_empty() {
        if handle.is_none() {
            match create_handle(&run_id, &jobs, is_replaying, ctx).await? {
                Ok(created) => {
                    ctx.gauges.workflows.increment();
                    *handle = Some(created);
                }
                Err(failure) => {
                    // Sandbox setup failed; the run is dead on arrival.
                    let failed = failed_activation_completion(&run_id, failure);
                    return Ok(StepOutcome {
                        completion: Some(encode_message(&failed)),
                        close: true,
                    });
                }
            }
        }

        let scoped = WorkflowActivation {
            run_id: run_id.clone(),
            timestamp_ms,
            is_replaying,
            jobs,
        };
        let live = handle.as_mut().expect("handle just ensured");
        match live
            .activate(&scoped, ctx.config.isolate_execution_timeout)
            .await
        {
            Ok(bytes) => {
                metrics::counter!("belay_workflow_activations_total").increment(1);
                completion = Some(bytes);
            }
            Err(err) => {
                warn!(run_id = %run_id, %err, "activation failed, evicting run");
                if let Some(dead) = handle.take() {
                    dead.dispose();
                    ctx.gauges.workflows.decrement();
                }
                let failure = failure_from_error(&err, sandbox_failure_type(&err));
                let failed = failed_activation_completion(&run_id, failure);
                return Ok(StepOutcome {
                    completion: Some(encode_message(&failed)),
                    close: true,
                });
            }
        }
    }

    if close {
        if let Some(evicted) = handle.take() {
            evicted.dispose();
            ctx.gauges.workflows.decrement();
        }
    }
    Ok(StepOutcome { completion, close })
}

/// First activation for a run: validate `startWorkflow`, acquire a sandbox
/// slot, create the sandbox and inject configured dependencies.
///
/// The outer error is fatal (invariant violation); the inner error is a
/// per-run failure.
async fn create_handle(
    run_id: &str,
    jobs: &[WorkflowActivationJob],
    is_replaying: bool,
    ctx: &Arc<WorkflowPipelineCtx>,
) -> Result<Result<WorkflowHandle, crate::proto::Failure>, WorkerError> {
    // Job order is server-defined; startWorkflow may appear anywhere.
    let start: Option<&StartWorkflow> = jobs.iter().find_map(|job| match &job.variant {
        Some(workflow_activation_job::Variant::StartWorkflow(start)) => Some(start),
        _ => None,
    });
    let Some(start) = start else {
        return Err(IllegalStateError::new(format!(
            "first activation for run {run_id} has no start_workflow job"
        ))
        .into());
    };
    if start.workflow_id.is_empty() || start.workflow_type.is_empty() || start.randomness_seed == 0
    {
        return Err(IllegalStateError::new(format!(
            "start_workflow for run {run_id} is missing workflow_id, workflow_type or randomness_seed"
        ))
        .into());
    }

    let slot = match ctx.pool.acquire().await {
        Ok(slot) => slot,
        Err(err) => {
            return Ok(Err(failure_from_error(&err, sandbox_failure_type(&err))));
        }
    };
    let options = SandboxOptions {
        info: WorkflowInfo {
            workflow_id: start.workflow_id.clone(),
            workflow_type: start.workflow_type.clone(),
            run_id: run_id.to_string(),
            task_queue: ctx.config.task_queue.clone(),
            namespace: ctx.config.namespace.clone(),
        },
        random_seed: start.randomness_seed,
        is_replaying,
        memory_mb: ctx.config.max_isolate_memory_mb,
        activity_start_to_close_timeout_ms: ctx
            .config
            .activity_defaults
            .start_to_close_timeout
            .as_millis() as u64,
    };
    let mut sandbox =
        match Sandbox::create(slot.snapshot(), options, Arc::clone(&ctx.converter)).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                warn!(run_id = %run_id, %err, "sandbox creation failed");
                return Ok(Err(failure_from_error(&err, sandbox_failure_type(&err))));
            }
        };
    for (iface, functions) in &ctx.config.dependencies {
        for (name, injected) in functions {
            sandbox.inject_dependency(
                iface.clone(),
                name.clone(),
                Arc::clone(&injected.f),
                injected.apply_mode,
                injected.call_during_replay,
            );
        }
    }

    info!(
        run_id = %run_id,
        workflow_id = %start.workflow_id,
        workflow_type = %start.workflow_type,
        slot = slot.slot(),
        "workflow run started"
    );
    Ok(Ok(WorkflowHandle {
        run_id: run_id.to_string(),
        sandbox,
        job_log: Vec::new(),
        _slot: slot,
    }))
}

fn sandbox_failure_type(err: &SandboxError) -> &'static str {
    match err {
        SandboxError::DeterminismViolation(_) => "DeterminismViolationError",
        SandboxError::Timeout { .. } => "TimeoutError",
        _ => "WorkflowTaskFailure",
    }
}

/// Submit one completion for this run. Per-run rejections become synthetic
/// evictions through the feedback channel; transport errors are fatal.
async fn submit_completion(ctx: &Arc<WorkflowPipelineCtx>, run_id: &str, completion: Vec<u8>) {
    match ctx
        .bridge
        .complete_workflow_activation(frame_bytes(&completion))
        .await
    {
        Ok(()) => {
            metrics::counter!("belay_workflow_completions_total").increment(1);
        }
        Err(BridgeError::Workflow { run_id: failed, message }) => {
            warn!(run_id = %failed, %message, "completion rejected, evicting run");
            let target = if failed.is_empty() { run_id.to_string() } else { failed };
            let _ = ctx
                .feedback_tx
                .send(eviction_activation(target, format!("completion rejected: {message}")));
        }
        Err(BridgeError::Shutdown) => {
            warn!(run_id = %run_id, "bridge refused completion while shutting down");
        }
        Err(err) => {
            ctx.fatal.fail(err.into());
        }
    }
}
