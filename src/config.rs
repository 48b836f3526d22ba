//! Worker configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::activity::ActivityInboundInterceptor;
use crate::convert::{DataConverter, JsonDataConverter};
use crate::errors::WorkerError;
use crate::sandbox::{ApplyMode, HostFn};

/// OS signals that trigger graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
}

/// Options applied to activity invocations issued from generated stubs.
#[derive(Debug, Clone)]
pub struct ActivityDefaults {
    /// Remote scheduling through the orchestration service. The only kind
    /// the worker core supports.
    pub kind: ActivityKind,
    pub start_to_close_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Remote,
}

impl Default for ActivityDefaults {
    fn default() -> Self {
        Self {
            kind: ActivityKind::Remote,
            start_to_close_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// One host function injected into sandboxes as an external dependency.
pub struct InjectedFunction {
    pub f: HostFn,
    pub apply_mode: ApplyMode,
    /// When false, calls made while an activation replays are skipped and
    /// resolve to null inside the sandbox.
    pub call_during_replay: bool,
}

/// A named external-dependency interface: function name to implementation.
pub type InjectedDependency = HashMap<String, InjectedFunction>;

/// Interceptor registration.
#[derive(Default)]
pub struct InterceptorOptions {
    /// Workflow-side interceptor modules, added to the bundle roster in
    /// registration order.
    pub workflow_modules: Vec<String>,
    /// Inbound activity interceptors, outermost first.
    pub activity_inbound: Vec<Arc<dyn ActivityInboundInterceptor>>,
}

/// All recognized worker knobs. Construct with [`WorkerConfig::new`] and
/// refine with the builder methods.
pub struct WorkerConfig {
    /// Identifies the pull queue. Required.
    pub task_queue: String,
    /// Namespace reported in activity info.
    pub namespace: String,
    /// Directory shallow-scanned for workflow modules (`.wat`).
    pub workflows_path: PathBuf,
    /// Additional module resolve roots (library modules, interceptors).
    pub dependency_roots: Vec<PathBuf>,
    /// Name of the bundle module exporting the sandbox interface.
    pub interface_module: String,

    pub activity_defaults: ActivityDefaults,
    pub max_concurrent_activity_task_executions: usize,
    pub max_concurrent_workflow_task_executions: usize,
    pub max_concurrent_activity_task_polls: usize,
    pub max_concurrent_workflow_task_polls: usize,
    /// Forwarded to the bridge at registration time.
    pub non_sticky_to_sticky_poll_ratio: f32,
    /// Forwarded to the bridge at registration time.
    pub sticky_queue_schedule_to_start_timeout: Duration,
    pub shutdown_grace_time: Duration,
    pub shutdown_signals: Vec<ShutdownSignal>,
    /// Hard wall-clock cap per sandbox activation.
    pub isolate_execution_timeout: Duration,
    /// Per-sandbox memory ceiling, in mebibytes.
    pub max_isolate_memory_mb: u64,
    pub isolate_pool_size: usize,
    pub data_converter: Arc<dyn DataConverter>,
    pub interceptors: InterceptorOptions,
    /// External dependencies injected into every sandbox, keyed by
    /// interface name.
    pub dependencies: HashMap<String, InjectedDependency>,
}

impl WorkerConfig {
    pub fn new(task_queue: impl Into<String>, workflows_path: impl Into<PathBuf>) -> Self {
        Self {
            task_queue: task_queue.into(),
            namespace: "default".to_string(),
            workflows_path: workflows_path.into(),
            dependency_roots: Vec::new(),
            interface_module: "workflow-interface".to_string(),
            activity_defaults: ActivityDefaults::default(),
            max_concurrent_activity_task_executions: 100,
            max_concurrent_workflow_task_executions: 100,
            max_concurrent_activity_task_polls: 5,
            max_concurrent_workflow_task_polls: 5,
            non_sticky_to_sticky_poll_ratio: 0.2,
            sticky_queue_schedule_to_start_timeout: Duration::from_millis(10_000),
            shutdown_grace_time: Duration::from_millis(5_000),
            shutdown_signals: vec![
                ShutdownSignal::Interrupt,
                ShutdownSignal::Terminate,
                ShutdownSignal::Quit,
            ],
            isolate_execution_timeout: Duration::from_millis(1_000),
            max_isolate_memory_mb: default_isolate_memory_mb(),
            isolate_pool_size: 8,
            data_converter: Arc::new(JsonDataConverter),
            interceptors: InterceptorOptions::default(),
            dependencies: HashMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_dependency_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.dependency_roots = roots;
        self
    }

    pub fn with_activity_defaults(mut self, defaults: ActivityDefaults) -> Self {
        self.activity_defaults = defaults;
        self
    }

    pub fn with_shutdown_grace_time(mut self, grace: Duration) -> Self {
        self.shutdown_grace_time = grace;
        self
    }

    pub fn with_shutdown_signals(mut self, signals: Vec<ShutdownSignal>) -> Self {
        self.shutdown_signals = signals;
        self
    }

    pub fn with_isolate_execution_timeout(mut self, timeout: Duration) -> Self {
        self.isolate_execution_timeout = timeout;
        self
    }

    pub fn with_max_isolate_memory_mb(mut self, megabytes: u64) -> Self {
        self.max_isolate_memory_mb = megabytes;
        self
    }

    pub fn with_isolate_pool_size(mut self, size: usize) -> Self {
        self.isolate_pool_size = size;
        self
    }

    pub fn with_data_converter(mut self, converter: Arc<dyn DataConverter>) -> Self {
        self.data_converter = converter;
        self
    }

    pub fn with_interceptors(mut self, interceptors: InterceptorOptions) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn with_dependencies(
        mut self,
        dependencies: HashMap<String, InjectedDependency>,
    ) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_concurrent_workflow_task_executions(mut self, max: usize) -> Self {
        self.max_concurrent_workflow_task_executions = max;
        self
    }

    pub fn with_max_concurrent_activity_task_executions(mut self, max: usize) -> Self {
        self.max_concurrent_activity_task_executions = max;
        self
    }

    pub fn with_max_concurrent_workflow_task_polls(mut self, max: usize) -> Self {
        self.max_concurrent_workflow_task_polls = max;
        self
    }

    pub fn with_max_concurrent_activity_task_polls(mut self, max: usize) -> Self {
        self.max_concurrent_activity_task_polls = max;
        self
    }

    /// Knobs the embedder forwards to the bridge when registering this
    /// worker. The worker core never interprets them.
    pub fn bridge_registration_options(&self) -> BridgeRegistrationOptions {
        BridgeRegistrationOptions {
            task_queue: self.task_queue.clone(),
            non_sticky_to_sticky_poll_ratio: self.non_sticky_to_sticky_poll_ratio,
            sticky_queue_schedule_to_start_timeout: self.sticky_queue_schedule_to_start_timeout,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), WorkerError> {
        if self.task_queue.is_empty() {
            return Err(WorkerError::Configuration("task_queue is required".into()));
        }
        if self.isolate_pool_size == 0 {
            return Err(WorkerError::Configuration(
                "isolate_pool_size must be at least 1".into(),
            ));
        }
        if self.max_concurrent_workflow_task_executions == 0
            || self.max_concurrent_activity_task_executions == 0
        {
            return Err(WorkerError::Configuration(
                "task execution concurrency must be at least 1".into(),
            ));
        }
        if self.max_concurrent_workflow_task_polls == 0
            || self.max_concurrent_activity_task_polls == 0
        {
            return Err(WorkerError::Configuration(
                "poll concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Bridge-owned knobs, split out so the embedder can hand them to its
/// bridge registration call.
#[derive(Debug, Clone)]
pub struct BridgeRegistrationOptions {
    pub task_queue: String,
    pub non_sticky_to_sticky_poll_ratio: f32,
    pub sticky_queue_schedule_to_start_timeout: Duration,
}

/// Default sandbox memory cap: total system memory less one GiB of host
/// headroom, floored at one GiB.
fn default_isolate_memory_mb() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_mb = system.total_memory() / (1024 * 1024);
    total_mb.saturating_sub(1024).max(1024)
}
