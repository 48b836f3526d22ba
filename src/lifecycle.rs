//! Worker lifecycle.
//!
//! A single eight-state machine gates polling, suspension, graceful drain
//! and failure. Transitions are globally serialized and broadcast, so every
//! observer sees the same total order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ShutdownSignal;
use crate::errors::{IllegalStateError, WorkerError};

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Initialized,
    Running,
    Suspended,
    Stopping,
    Draining,
    Drained,
    Stopped,
    Failed,
}

impl WorkerState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Initialized => "INITIALIZED",
            WorkerState::Running => "RUNNING",
            WorkerState::Suspended => "SUSPENDED",
            WorkerState::Stopping => "STOPPING",
            WorkerState::Draining => "DRAINING",
            WorkerState::Drained => "DRAINED",
            WorkerState::Stopped => "STOPPED",
            WorkerState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Whether `from -> to` is a legal transition. `Failed` is reachable from
/// every non-terminal state; everything else follows the fixed graph.
pub fn transition_allowed(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::*;
    if from.is_terminal() {
        return false;
    }
    match to {
        Failed => true,
        Running => matches!(from, Initialized | Suspended),
        Suspended => matches!(from, Running),
        Stopping => matches!(from, Running | Suspended),
        Draining => matches!(from, Stopping),
        Drained => matches!(from, Draining),
        Stopped => matches!(from, Drained),
        Initialized => false,
    }
}

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Serializes and broadcasts state transitions.
pub struct LifecycleController {
    current: Mutex<WorkerState>,
    state_tx: watch::Sender<WorkerState>,
    transitions_tx: broadcast::Sender<WorkerState>,
}

impl LifecycleController {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Initialized);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(WorkerState::Initialized),
            state_tx,
            transitions_tx,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.current.lock().expect("lifecycle lock poisoned")
    }

    /// Watch the current state. Coalesces rapid transitions; use
    /// [`subscribe_transitions`](Self::subscribe_transitions) to observe
    /// every step.
    pub fn watch(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Receive every transition, in commit order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<WorkerState> {
        self.transitions_tx.subscribe()
    }

    /// Move to `to`, failing if the step is not in the transition graph.
    pub fn transition(&self, to: WorkerState) -> Result<(), IllegalStateError> {
        let mut current = self.current.lock().expect("lifecycle lock poisoned");
        if !transition_allowed(*current, to) {
            return Err(IllegalStateError::new(format!(
                "cannot transition worker state {current} -> {to}"
            )));
        }
        info!(from = %*current, to = %to, "worker state transition");
        *current = to;
        self.state_tx.send_replace(to);
        let _ = self.transitions_tx.send(to);
        Ok(())
    }

    /// Best-effort transition to `Failed`. No-op from terminal states.
    /// Returns whether the state changed.
    pub fn fail(&self) -> bool {
        let mut current = self.current.lock().expect("lifecycle lock poisoned");
        if current.is_terminal() {
            return false;
        }
        info!(from = %*current, "worker state transition to FAILED");
        *current = WorkerState::Failed;
        self.state_tx.send_replace(WorkerState::Failed);
        let _ = self.transitions_tx.send(WorkerState::Failed);
        true
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the first fatal error and fails the worker.
#[derive(Clone)]
pub struct FatalSink {
    lifecycle: Arc<LifecycleController>,
    first: Arc<Mutex<Option<WorkerError>>>,
}

impl FatalSink {
    pub fn new(lifecycle: Arc<LifecycleController>) -> Self {
        Self {
            lifecycle,
            first: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail(&self, error: WorkerError) {
        error!(%error, "fatal worker error");
        metrics::counter!("belay_fatal_errors_total").increment(1);
        {
            let mut slot = self.first.lock().expect("fatal sink lock poisoned");
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.lifecycle.fail();
    }

    /// The first recorded fatal error, if any.
    pub fn take(&self) -> Option<WorkerError> {
        self.first.lock().expect("fatal sink lock poisoned").take()
    }
}

/// What the shared poll loop should do next, given the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollDecision {
    Proceed,
    Stop,
}

/// Gate one poll iteration on the lifecycle. `RUNNING`, `STOPPING` and
/// `DRAINING` proceed; `SUSPENDED` parks until the state moves; everything
/// else terminates the loop.
pub(crate) async fn poll_gate(rx: &mut watch::Receiver<WorkerState>) -> PollDecision {
    loop {
        let state = *rx.borrow();
        match state {
            WorkerState::Running | WorkerState::Stopping | WorkerState::Draining => {
                return PollDecision::Proceed;
            }
            WorkerState::Suspended => {
                if rx.changed().await.is_err() {
                    return PollDecision::Stop;
                }
            }
            WorkerState::Initialized
            | WorkerState::Drained
            | WorkerState::Stopped
            | WorkerState::Failed => return PollDecision::Stop,
        }
    }
}

/// Graceful-shutdown watchdog: once the worker enters `STOPPING`, the drain
/// must reach `DRAINED` within `grace` or the worker fails.
pub(crate) fn spawn_grace_watchdog(
    lifecycle: Arc<LifecycleController>,
    fatal: FatalSink,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = lifecycle.watch();
        let entered = rx
            .wait_for(|state| !matches!(state, WorkerState::Initialized | WorkerState::Running | WorkerState::Suspended))
            .await
            .map(|state| *state);
        match entered {
            Ok(state) if matches!(state, WorkerState::Stopping | WorkerState::Draining) => {}
            _ => return,
        }
        tokio::time::sleep(grace).await;
        let state = lifecycle.state();
        if matches!(state, WorkerState::Stopping | WorkerState::Draining) {
            warn!(
                grace_ms = grace.as_millis() as u64,
                %state,
                "graceful shutdown period expired before drain completed"
            );
            fatal.fail(WorkerError::GracefulShutdownPeriodExpired {
                grace_ms: grace.as_millis() as u64,
            });
        }
    })
}

/// Listen for the configured OS signals and report each occurrence.
#[cfg(unix)]
pub(crate) fn spawn_signal_listener(
    signals: Vec<ShutdownSignal>,
    notify: mpsc::UnboundedSender<ShutdownSignal>,
) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut streams = Vec::new();
        for sig in signals {
            let kind = match sig {
                ShutdownSignal::Interrupt => SignalKind::interrupt(),
                ShutdownSignal::Terminate => SignalKind::terminate(),
                ShutdownSignal::Quit => SignalKind::quit(),
            };
            match signal(kind) {
                Ok(stream) => streams.push((sig, stream)),
                Err(err) => warn!(?sig, %err, "failed to register signal handler"),
            }
        }
        if streams.is_empty() {
            return;
        }
        loop {
            let waits = streams
                .iter_mut()
                .map(|(sig, stream)| {
                    let sig = *sig;
                    Box::pin(async move { stream.recv().await.map(|_| sig) })
                })
                .collect::<Vec<_>>();
            let (received, _, _) = futures::future::select_all(waits).await;
            match received {
                Some(sig) => {
                    info!(?sig, "shutdown signal received");
                    if notify.send(sig).is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    })
}

#[cfg(not(unix))]
pub(crate) fn spawn_signal_listener(
    _signals: Vec<ShutdownSignal>,
    notify: mpsc::UnboundedSender<ShutdownSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = notify.send(ShutdownSignal::Interrupt);
        }
    })
}
