//! Activity task pipeline.
//!
//! Tasks are grouped by `base64(task_token)`. A group sees at most one
//! `start` and, possibly, one subsequent `cancel`: the start resolves and
//! launches the activity, the cancel signals the running handle. The
//! terminal completion is emitted by the launched run, which also closes
//! the group.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{
    execute_activity, ActivityContext, ActivityExecuteInput, ActivityHandle, ActivityInfo,
    ActivityOutcome, ActivityRegistry,
};
use crate::bridge::{BridgeError, WorkerBridge};
use crate::config::WorkerConfig;
use crate::convert::{decode_all, DataConverter};
use crate::errors::IllegalStateError;
use crate::heartbeat::HeartbeatSender;
use crate::lifecycle::{FatalSink, LifecycleController};
use crate::messages::{decode_framed, failure_from_message, frame_bytes};
use crate::pipeline::{GroupClosed, GroupTable, WorkerGauges, GROUP_CHANNEL_CAPACITY};
use crate::proto::{
    activity_task, activity_task_completion, ActivityResultCancelled, ActivityResultCompleted,
    ActivityResultFailed, ActivityStart, ActivityTask, ActivityTaskCompletion,
};

/// Shared dependencies of the activity pipeline.
pub(crate) struct ActivityPipelineCtx {
    pub bridge: Arc<dyn WorkerBridge>,
    pub registry: Arc<ActivityRegistry>,
    pub converter: Arc<dyn DataConverter>,
    pub config: Arc<WorkerConfig>,
    pub gauges: Arc<WorkerGauges>,
    pub fatal: FatalSink,
    pub lifecycle: Arc<LifecycleController>,
    pub exec_semaphore: Arc<Semaphore>,
    pub heartbeats: HeartbeatSender,
    pub closed_tx: mpsc::UnboundedSender<GroupClosed>,
}

fn group_key(task_token: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(task_token)
}

pub(crate) fn spawn_activity_pipeline(
    ctx: Arc<ActivityPipelineCtx>,
    poll_rx: mpsc::Receiver<Vec<u8>>,
    closed_rx: mpsc::UnboundedReceiver<GroupClosed>,
) -> JoinHandle<()> {
    tokio::spawn(dispatch_loop(ctx, poll_rx, closed_rx))
}

async fn dispatch_loop(
    ctx: Arc<ActivityPipelineCtx>,
    mut poll_rx: mpsc::Receiver<Vec<u8>>,
    mut closed_rx: mpsc::UnboundedReceiver<GroupClosed>,
) {
    let mut groups: GroupTable<ActivityTask> = GroupTable::default();
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
            polled = poll_rx.recv(), if !polling_done => {
                match polled {
                    Some(bytes) => match decode_framed::<ActivityTask>(&bytes) {
                        Ok(task) => route(&ctx, &mut groups, task).await,
                        Err(err) => {
                            ctx.fatal.fail(err.into());
                            break;
                        }
                    },
                    None => {
                        debug!("activity pollers finished");
                        polling_done = true;
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
    debug!("activity pipeline closed");
}

async fn route(
    ctx: &Arc<ActivityPipelineCtx>,
    groups: &mut GroupTable<ActivityTask>,
    mut task: ActivityTask,
) {
    let key = group_key(&task.task_token);
    loop {
        let tx = match groups.get(&key) {
            Some(tx) => tx,
            None => {
                let (tx, rx) = mpsc::channel(GROUP_CHANNEL_CAPACITY);
                let generation = groups.insert(key.clone(), tx.clone());
                tokio::spawn(run_group(key.clone(), generation, rx, Arc::clone(ctx)));
                tx
            }
        };
        match tx.send(task).await {
            Ok(()) => return,
            Err(send_error) => {
                // The group closed out from under us (terminal completion
                // raced this task); recreate and retry.
                task = send_error.0;
                groups.remove(&key);
            }
        }
    }
}

/// Serial per-token processor holding `Option<ActivityHandle>`. The first
/// task must be `start`; a later `cancel` signals the handle and surfaces
/// through the in-progress run.
async fn run_group(
    key: String,
    generation: u64,
    mut rx: mpsc::Receiver<ActivityTask>,
    ctx: Arc<ActivityPipelineCtx>,
) {
    let mut handle: Option<ActivityHandle> = None;
    while let Some(task) = rx.recv().await {
        match task.variant {
            Some(activity_task::Variant::Start(start)) => {
                if handle.is_some() {
                    ctx.fatal.fail(
                        IllegalStateError::new(format!(
                            "duplicate start for activity task token {key}"
                        ))
                        .into(),
                    );
                    break;
                }
                match launch(
                    &key,
                    generation,
                    task.task_token,
                    task.activity_id,
                    start,
                    &ctx,
                )
                .await
                {
                    LaunchResult::Running(running) => handle = Some(running),
                    LaunchResult::Rejected => break,
                }
            }
            Some(activity_task::Variant::Cancel(cancel)) => match &handle {
                Some(running) => running.cancel(&cancel.reason),
                None => {
                    // Unknown token: nothing to do, nothing to emit. Close
                    // the group so the spurious identity does not linger.
                    warn!(
                        task_token = %key,
                        found = false,
                        "cancel for unknown activity task token"
                    );
                    let _ = ctx.closed_tx.send(GroupClosed {
                        key: key.clone(),
                        generation,
                    });
                    break;
                }
            },
            None => {
                ctx.fatal.fail(
                    IllegalStateError::new(format!(
                        "activity task for token {key} carries no variant"
                    ))
                    .into(),
                );
                break;
            }
        }
    }
}

enum LaunchResult {
    /// The activity is running; the spawned task emits the completion and
    /// closes the group.
    Running(ActivityHandle),
    /// A failure completion was synthesized; the group is already closed.
    Rejected,
}

/// Resolve and decode a `start`, then launch the activity run. Resolution
/// and decode failures synthesize an immediate failure completion without
/// ever creating a handle.
async fn launch(
    key: &str,
    generation: u64,
    task_token: Vec<u8>,
    activity_id: String,
    start: ActivityStart,
    ctx: &Arc<ActivityPipelineCtx>,
) -> LaunchResult {
    let (activity_type, f) = match ctx.registry.resolve(&start.activity_type) {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(activity_id = %activity_id, %err, "activity resolution failed");
            reject(ctx, key, generation, task_token, err.to_string()).await;
            return LaunchResult::Rejected;
        }
    };
    let args = match decode_all(&*ctx.converter, &start.input).await {
        Ok(args) => args,
        Err(err) => {
            warn!(activity_id = %activity_id, %err, "activity argument decode failed");
            reject(
                ctx,
                key,
                generation,
                task_token,
                format!("failed to decode activity arguments: {err}"),
            )
            .await;
            return LaunchResult::Rejected;
        }
    };
    let heartbeat_details = match decode_all(&*ctx.converter, &start.heartbeat_details).await {
        Ok(details) => details,
        Err(err) => {
            warn!(activity_id = %activity_id, %err, "heartbeat details decode failed");
            reject(
                ctx,
                key,
                generation,
                task_token,
                format!("failed to decode heartbeat details: {err}"),
            )
            .await;
            return LaunchResult::Rejected;
        }
    };

    let info = Arc::new(ActivityInfo {
        activity_id: activity_id.clone(),
        activity_type,
        attempt: start.attempt,
        scheduled_time_ms: start.scheduled_time_ms,
        schedule_to_close_timeout: timeout_ms(start.schedule_to_close_timeout_ms),
        start_to_close_timeout: timeout_ms(start.start_to_close_timeout_ms),
        heartbeat_timeout: timeout_ms(start.heartbeat_timeout_ms),
        heartbeat_details,
        workflow_namespace: start.workflow_namespace,
        workflow_type: start.workflow_type,
        workflow_id: start.workflow_id,
        workflow_run_id: start.workflow_run_id,
        task_queue: ctx.config.task_queue.clone(),
        namespace: ctx.config.namespace.clone(),
    });

    let handle = ActivityHandle::new(task_token.clone(), activity_id.clone());
    ctx.gauges.activities.increment();
    let context = ActivityContext::new(Arc::clone(&info), &handle, ctx.heartbeats.clone());
    let input = ActivityExecuteInput {
        args,
        headers: start.header,
    };

    let run_ctx = Arc::clone(ctx);
    let run_key = key.to_string();
    tokio::spawn(async move {
        let permit = match Arc::clone(&run_ctx.exec_semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        info!(
            activity_id = %info.activity_id,
            attempt = info.attempt,
            workflow_run_id = %info.workflow_run_id,
            "activity started"
        );
        let outcome = execute_activity(
            context,
            f,
            &run_ctx.config.interceptors.activity_inbound,
            input,
        )
        .await;
        drop(permit);

        let completion = completion_from_outcome(&run_ctx, &task_token, outcome).await;
        submit_completion(&run_ctx, completion).await;
        run_ctx.gauges.activities.decrement();
        let _ = run_ctx.closed_tx.send(GroupClosed {
            key: run_key,
            generation,
        });
    });

    LaunchResult::Running(handle)
}

fn timeout_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Synthesize an immediate failure completion and close the group.
async fn reject(
    ctx: &Arc<ActivityPipelineCtx>,
    key: &str,
    generation: u64,
    task_token: Vec<u8>,
    message: String,
) {
    let completion = ActivityTaskCompletion {
        task_token,
        status: Some(activity_task_completion::Status::Failed(
            ActivityResultFailed {
                failure: Some(failure_from_message(message, "ApplicationFailure")),
            },
        )),
    };
    submit_completion(ctx, completion).await;
    let _ = ctx.closed_tx.send(GroupClosed {
        key: key.to_string(),
        generation,
    });
}

async fn completion_from_outcome(
    ctx: &Arc<ActivityPipelineCtx>,
    task_token: &[u8],
    outcome: ActivityOutcome,
) -> ActivityTaskCompletion {
    let status = match outcome {
        ActivityOutcome::Completed(value) => match ctx.converter.encode(&value).await {
            Ok(payload) => activity_task_completion::Status::Completed(ActivityResultCompleted {
                result: Some(payload),
            }),
            Err(err) => activity_task_completion::Status::Failed(ActivityResultFailed {
                failure: Some(failure_from_message(
                    format!("failed to encode activity result: {err}"),
                    "ApplicationFailure",
                )),
            }),
        },
        ActivityOutcome::Failed(failure) => {
            activity_task_completion::Status::Failed(ActivityResultFailed {
                failure: Some(failure),
            })
        }
        ActivityOutcome::Cancelled(details) => {
            match crate::convert::encode_all(&*ctx.converter, &details).await {
                Ok(details) => {
                    activity_task_completion::Status::Cancelled(ActivityResultCancelled { details })
                }
                Err(err) => activity_task_completion::Status::Failed(ActivityResultFailed {
                    failure: Some(failure_from_message(
                        format!("failed to encode cancellation details: {err}"),
                        "ApplicationFailure",
                    )),
                }),
            }
        }
    };
    ActivityTaskCompletion {
        task_token: task_token.to_vec(),
        status: Some(status),
    }
}

async fn submit_completion(ctx: &Arc<ActivityPipelineCtx>, completion: ActivityTaskCompletion) {
    let framed = frame_bytes(&crate::messages::encode_message(&completion));
    match ctx.bridge.complete_activity_task(framed).await {
        Ok(()) => {
            metrics::counter!("belay_activity_completions_total").increment(1);
        }
        Err(BridgeError::Shutdown) => {
            warn!("bridge refused activity completion while shutting down");
        }
        Err(BridgeError::Workflow { run_id, message }) => {
            warn!(%run_id, %message, "unexpected per-run error from activity completion");
        }
        Err(err) => {
            ctx.fatal.fail(err.into());
        }
    }
}
