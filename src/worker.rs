//! Worker façade.
//!
//! Construction runs the bundler and compiles the sandbox snapshot;
//! `run()` wires the lifecycle, both pipelines, the heartbeat forwarder
//! and the drain machinery, then resolves after `STOPPED` or rejects with
//! the first fatal error. Pool teardown and bridge de-registration always
//! happen on the way out.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::activity::ActivityRegistry;
use crate::bridge::{BridgeError, WorkerBridge};
use crate::config::WorkerConfig;
use crate::errors::{IllegalStateError, WorkerError};
use crate::heartbeat::{heartbeat_channel, spawn_heartbeat_forwarder};
use crate::lifecycle::{
    spawn_grace_watchdog, spawn_signal_listener, FatalSink, LifecycleController, WorkerState,
};
use crate::pipeline::{
    spawn_activity_pipeline, spawn_drain_idle_detector, spawn_pollers, spawn_workflow_pipeline,
    ActivityPipelineCtx, PollKind, WorkerGauges, WorkflowPipelineCtx,
};
use crate::sandbox::{
    BundleOptions, EpochTicker, SandboxBundler, SandboxPool, SandboxSnapshot, WorkflowBundle,
};

/// Drives the shutdown handshake: `STOPPING`, bridge drain, `DRAINING`.
#[derive(Clone)]
struct ShutdownDriver {
    lifecycle: Arc<LifecycleController>,
    bridge: Arc<dyn WorkerBridge>,
    fatal: FatalSink,
}

impl ShutdownDriver {
    async fn initiate(&self) -> Result<(), WorkerError> {
        match self.lifecycle.state() {
            WorkerState::Running | WorkerState::Suspended => {}
            WorkerState::Initialized => {
                return Err(IllegalStateError::new(
                    "shutdown requested before run()".to_string(),
                )
                .into());
            }
            // Already shutting down, or already failed.
            _ => return Ok(()),
        }
        if self.lifecycle.transition(WorkerState::Stopping).is_err() {
            // Lost the race to a concurrent shutdown.
            return Ok(());
        }
        match self.bridge.initiate_shutdown().await {
            Ok(()) | Err(BridgeError::Shutdown) => {
                let _ = self.lifecycle.transition(WorkerState::Draining);
                Ok(())
            }
            Err(err) => {
                self.fatal.fail(err.clone().into());
                Err(err.into())
            }
        }
    }
}

/// A durable-execution worker: a stateless processor between the bridge
/// and its sandboxes.
pub struct Worker {
    config: Arc<WorkerConfig>,
    bridge: Arc<dyn WorkerBridge>,
    registry: Arc<ActivityRegistry>,
    lifecycle: Arc<LifecycleController>,
    fatal: FatalSink,
    gauges: Arc<WorkerGauges>,
    snapshot: Arc<SandboxSnapshot>,
    pool: Arc<SandboxPool>,
    driver: ShutdownDriver,
}

impl Worker {
    /// Bundle the workflows directory, compile the sandbox snapshot and
    /// build the pool. Bundler diagnostics fail construction.
    pub fn new(
        config: WorkerConfig,
        bridge: Arc<dyn WorkerBridge>,
        registry: ActivityRegistry,
    ) -> Result<Self, WorkerError> {
        config.validate()?;

        let bundle = Self::bundle(&config, &registry)?;
        let snapshot = SandboxSnapshot::compile(&bundle)?;
        let pool = Arc::new(SandboxPool::new(
            Arc::clone(&snapshot),
            config.isolate_pool_size,
        ));

        let lifecycle = Arc::new(LifecycleController::new());
        let fatal = FatalSink::new(Arc::clone(&lifecycle));
        let driver = ShutdownDriver {
            lifecycle: Arc::clone(&lifecycle),
            bridge: Arc::clone(&bridge),
            fatal: fatal.clone(),
        };

        info!(
            task_queue = %config.task_queue,
            bundle_digest = %bundle.digest(),
            pool_size = config.isolate_pool_size,
            "worker constructed"
        );
        Ok(Self {
            config: Arc::new(config),
            bridge,
            registry: Arc::new(registry),
            lifecycle,
            fatal,
            gauges: Arc::new(WorkerGauges::new()),
            snapshot,
            pool,
            driver,
        })
    }

    fn bundle(
        config: &WorkerConfig,
        registry: &ActivityRegistry,
    ) -> Result<WorkflowBundle, WorkerError> {
        let bundler = SandboxBundler::new(BundleOptions {
            workflows_path: config.workflows_path.clone(),
            dependency_roots: config.dependency_roots.clone(),
            activity_stubs: registry.stub_roster(),
            interceptor_modules: config.interceptors.workflow_modules.clone(),
            interface_module: config.interface_module.clone(),
            activity_defaults: config.activity_defaults.clone(),
        });
        Ok(bundler.build()?)
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// Watch the current state (coalescing).
    pub fn watch_state(&self) -> tokio::sync::watch::Receiver<WorkerState> {
        self.lifecycle.watch()
    }

    /// Observe every state transition in commit order.
    pub fn subscribe_transitions(&self) -> tokio::sync::broadcast::Receiver<WorkerState> {
        self.lifecycle.subscribe_transitions()
    }

    pub fn in_flight_activations(&self) -> usize {
        self.gauges.activations.value()
    }

    pub fn in_flight_activities(&self) -> usize {
        self.gauges.activities.value()
    }

    pub fn running_workflows(&self) -> usize {
        self.gauges.workflows.value()
    }

    /// Park the pollers. No poll is issued until polling resumes; polls
    /// already in flight are not cancelled.
    pub fn suspend_polling(&self) -> Result<(), IllegalStateError> {
        self.lifecycle.transition(WorkerState::Suspended)
    }

    pub fn resume_polling(&self) -> Result<(), IllegalStateError> {
        if self.lifecycle.state() != WorkerState::Suspended {
            return Err(IllegalStateError::new(
                "resume_polling is only legal while suspended".to_string(),
            ));
        }
        self.lifecycle.transition(WorkerState::Running)
    }

    /// Begin graceful shutdown: stop accepting new work, drain in-flight
    /// work, bounded by the configured grace period.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.driver.initiate().await
    }

    /// Run the worker to completion. Legal only from `INITIALIZED`.
    /// Resolves once the worker reaches `STOPPED`, or with the first fatal
    /// error once it reaches `FAILED`.
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.lifecycle.transition(WorkerState::Running)?;

        let _epoch_ticker = EpochTicker::spawn(&self.snapshot);

        // OS signals feed the shutdown driver.
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let signal_listener =
            spawn_signal_listener(self.config.shutdown_signals.clone(), signal_tx);
        let signal_driver = self.driver.clone();
        let signal_pump = tokio::spawn(async move {
            while signal_rx.recv().await.is_some() {
                let _ = signal_driver.initiate().await;
            }
        });

        let watchdog = spawn_grace_watchdog(
            Arc::clone(&self.lifecycle),
            self.fatal.clone(),
            self.config.shutdown_grace_time,
        );

        let (heartbeat_tx, heartbeat_rx) = heartbeat_channel();
        let heartbeat_task = spawn_heartbeat_forwarder(
            heartbeat_rx,
            Arc::clone(&self.bridge),
            Arc::clone(&self.config.data_converter),
            self.lifecycle.watch(),
        );

        // Workflow pipeline.
        let (wf_poll_tx, wf_poll_rx) = mpsc::channel(1);
        let wf_pollers = spawn_pollers(
            PollKind::Workflow,
            self.config.max_concurrent_workflow_task_polls,
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.bridge),
            wf_poll_tx,
            self.fatal.clone(),
        );
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (wf_closed_tx, wf_closed_rx) = mpsc::unbounded_channel();
        let (sweep_tx, sweep_rx) = mpsc::unbounded_channel();
        let workflow_ctx = Arc::new(WorkflowPipelineCtx {
            bridge: Arc::clone(&self.bridge),
            pool: Arc::clone(&self.pool),
            converter: Arc::clone(&self.config.data_converter),
            config: Arc::clone(&self.config),
            gauges: Arc::clone(&self.gauges),
            fatal: self.fatal.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            exec_semaphore: Arc::new(Semaphore::new(
                self.config.max_concurrent_workflow_task_executions,
            )),
            feedback_tx,
            closed_tx: wf_closed_tx,
        });
        let workflow_task = spawn_workflow_pipeline(
            workflow_ctx,
            wf_poll_rx,
            feedback_rx,
            wf_closed_rx,
            sweep_rx,
        );

        // Activity pipeline.
        let (at_poll_tx, at_poll_rx) = mpsc::channel(1);
        let at_pollers = spawn_pollers(
            PollKind::Activity,
            self.config.max_concurrent_activity_task_polls,
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.bridge),
            at_poll_tx,
            self.fatal.clone(),
        );
        let (at_closed_tx, at_closed_rx) = mpsc::unbounded_channel();
        let activity_ctx = Arc::new(ActivityPipelineCtx {
            bridge: Arc::clone(&self.bridge),
            registry: Arc::clone(&self.registry),
            converter: Arc::clone(&self.config.data_converter),
            config: Arc::clone(&self.config),
            gauges: Arc::clone(&self.gauges),
            fatal: self.fatal.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            exec_semaphore: Arc::new(Semaphore::new(
                self.config.max_concurrent_activity_task_executions,
            )),
            heartbeats: heartbeat_tx,
            closed_tx: at_closed_tx,
        });
        let activity_task = spawn_activity_pipeline(activity_ctx, at_poll_rx, at_closed_rx);

        let idle_detector = spawn_drain_idle_detector(
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.gauges),
            sweep_tx,
        );

        // Await pipeline completion. Group tasks submit their completions
        // before the dispatchers can observe them closed, so once both
        // dispatchers return, in-flight work has fully drained (or the
        // worker failed).
        let _ = workflow_task.await;
        let _ = activity_task.await;
        // Pollers blocked in a long poll are not cancelled by STOPPING,
        // but nothing consumes them anymore.
        for poller in wf_pollers.into_iter().chain(at_pollers) {
            poller.abort();
            let _ = poller.await;
        }

        // A bridge-initiated drain completes the pipelines without a local
        // shutdown() call; run the handshake now so the state machine
        // still walks STOPPING -> DRAINING -> DRAINED -> STOPPED.
        if matches!(
            self.lifecycle.state(),
            WorkerState::Running | WorkerState::Suspended
        ) {
            let _ = self.driver.initiate().await;
        }
        if self.lifecycle.state() == WorkerState::Stopping {
            let _ = self.lifecycle.transition(WorkerState::Draining);
        }
        if self.lifecycle.state() == WorkerState::Draining {
            debug_assert_eq!(self.gauges.activations.value(), 0);
            debug_assert_eq!(self.gauges.activities.value(), 0);
            let _ = self.lifecycle.transition(WorkerState::Drained);
        }
        // The forwarder exits on DRAINED (or a terminal state).
        let _ = heartbeat_task.await;
        if self.lifecycle.state() == WorkerState::Drained {
            let _ = self.lifecycle.transition(WorkerState::Stopped);
        }

        idle_detector.abort();
        watchdog.abort();
        signal_listener.abort();
        signal_pump.abort();

        // Always release the pool and de-register from the bridge,
        // regardless of how the pipelines ended.
        self.pool.destroy();
        if let Err(err) = self.bridge.complete_shutdown().await {
            warn!(%err, "bridge shutdown completion failed");
        }

        match self.lifecycle.state() {
            WorkerState::Stopped => {
                info!("worker stopped");
                Ok(())
            }
            WorkerState::Failed => Err(self.fatal.take().unwrap_or_else(|| {
                IllegalStateError::new("worker failed without a recorded error".to_string()).into()
            })),
            other => Err(IllegalStateError::new(format!(
                "worker run loop exited in non-terminal state {other}"
            ))
            .into()),
        }
    }
}
