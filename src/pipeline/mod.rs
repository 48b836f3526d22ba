//! The dual task pipelines.
//!
//! Both pipelines share the same shape: a set of pollers feeds decoded
//! tasks through a capacity-one channel into a dispatcher, which buckets
//! them into per-identity groups. Each group processes strictly serially
//! with an `Option<Handle>` accumulator; across groups the pipeline is
//! parallel, bounded by a semaphore. In-flight gauges are incremented at
//! group entry and decremented at completion emission, and feed drain
//! detection.

mod activity;
mod workflow;

pub(crate) use activity::{spawn_activity_pipeline, ActivityPipelineCtx};
pub(crate) use workflow::{spawn_workflow_pipeline, WorkflowPipelineCtx};

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bridge::{BridgeError, WorkerBridge};
use crate::lifecycle::{poll_gate, FatalSink, LifecycleController, PollDecision, WorkerState};

/// Per-group channel depth. Small: a full group exerts backpressure on the
/// dispatcher, which in turn stops consuming polls.
pub(crate) const GROUP_CHANNEL_CAPACITY: usize = 8;

/// Close notification from a group task. The generation guards against a
/// stale notification removing a newer group re-created under the same
/// identity.
pub(crate) struct GroupClosed {
    pub key: String,
    pub generation: u64,
}

/// Per-identity groups, each a generation-tagged channel into a serial
/// group task.
pub(crate) struct GroupTable<T> {
    groups: std::collections::HashMap<String, (u64, mpsc::Sender<T>)>,
    next_generation: u64,
}

impl<T> Default for GroupTable<T> {
    fn default() -> Self {
        Self {
            groups: std::collections::HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<T> GroupTable<T> {
    pub(crate) fn get(&self, key: &str) -> Option<mpsc::Sender<T>> {
        self.groups.get(key).map(|(_, tx)| tx.clone())
    }

    /// Register a fresh group and return its generation.
    pub(crate) fn insert(&mut self, key: String, tx: mpsc::Sender<T>) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.groups.insert(key, (generation, tx));
        generation
    }

    pub(crate) fn remove(&mut self, key: &str) {
        self.groups.remove(key);
    }

    /// Remove the group only if the notification matches its generation.
    pub(crate) fn remove_closed(&mut self, closed: &GroupClosed) {
        if let Some((generation, _)) = self.groups.get(&closed.key) {
            if *generation == closed.generation {
                self.groups.remove(&closed.key);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn live_keys(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}

/// A monotonic in-flight gauge observable through a watch channel, so the
/// drain logic can await zero without polling.
pub struct InFlightGauge {
    tx: watch::Sender<usize>,
    name: &'static str,
}

impl InFlightGauge {
    pub(crate) fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx, name }
    }

    pub(crate) fn increment(&self) {
        self.tx.send_modify(|count| *count += 1);
        metrics::gauge!(self.name).increment(1.0);
    }

    pub(crate) fn decrement(&self) {
        self.tx.send_modify(|count| {
            debug_assert!(*count > 0, "gauge {} underflow", self.name);
            *count = count.saturating_sub(1);
        });
        metrics::gauge!(self.name).decrement(1.0);
    }

    pub fn value(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }
}

/// The three worker-wide gauges used for drain detection.
pub struct WorkerGauges {
    /// Activations currently inside a workflow group.
    pub activations: InFlightGauge,
    /// Activity attempts with a live handle.
    pub activities: InFlightGauge,
    /// Workflow runs holding a sandbox.
    pub workflows: InFlightGauge,
}

impl WorkerGauges {
    pub(crate) fn new() -> Self {
        Self {
            activations: InFlightGauge::new("belay_in_flight_activations"),
            activities: InFlightGauge::new("belay_in_flight_activities"),
            workflows: InFlightGauge::new("belay_running_workflows"),
        }
    }
}

/// Which bridge poll a poller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollKind {
    Workflow,
    Activity,
}

/// Spawn `count` pollers. Each gates every call on the lifecycle, treats
/// [`BridgeError::Shutdown`] as stream completion and anything else fatal.
/// Backpressure: the shared output channel has capacity one, so a poller
/// does not start its next call until the dispatcher has taken the prior
/// decoded task toward its group.
pub(crate) fn spawn_pollers(
    kind: PollKind,
    count: usize,
    lifecycle: Arc<LifecycleController>,
    bridge: Arc<dyn WorkerBridge>,
    out_tx: mpsc::Sender<Vec<u8>>,
    fatal: FatalSink,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let mut state_rx = lifecycle.watch();
            let bridge = Arc::clone(&bridge);
            let out_tx = out_tx.clone();
            let fatal = fatal.clone();
            tokio::spawn(async move {
                loop {
                    if poll_gate(&mut state_rx).await == PollDecision::Stop {
                        break;
                    }
                    let polled = match kind {
                        PollKind::Workflow => bridge.poll_workflow_activation().await,
                        PollKind::Activity => bridge.poll_activity_task().await,
                    };
                    match polled {
                        Ok(bytes) => {
                            if out_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(BridgeError::Shutdown) => {
                            debug!(?kind, index, "poll stream completed");
                            break;
                        }
                        Err(err) => {
                            metrics::counter!("belay_poll_errors_total").increment(1);
                            error!(?kind, index, %err, "poll failed");
                            fatal.fail(err.into());
                            break;
                        }
                    }
                }
            })
        })
        .collect()
}

/// Emits once when the worker is draining and no activations are in
/// flight. The workflow dispatcher answers by sweeping live runs with
/// synthetic evictions so sandboxes release cleanly.
pub(crate) fn spawn_drain_idle_detector(
    lifecycle: Arc<LifecycleController>,
    gauges: Arc<WorkerGauges>,
    sweep_tx: mpsc::UnboundedSender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state_rx = lifecycle.watch();
        let mut activations_rx = gauges.activations.watch();
        loop {
            let state = *state_rx.borrow();
            if state.is_terminal() {
                return;
            }
            if state == WorkerState::Draining && *activations_rx.borrow() == 0 {
                debug!("drain idle detected, sweeping live workflow runs");
                if sweep_tx.send(()).is_err() {
                    warn!("workflow pipeline gone before drain sweep");
                }
                return;
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = activations_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    })
}
