//! Activity execution: registry, handles and per-task state.

mod runner;

pub use runner::{
    ActivityExecuteInput, ActivityInboundInterceptor, ActivityOutcome, NextActivityExecutor,
};
pub(crate) use runner::execute_activity;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::heartbeat::{HeartbeatRecord, HeartbeatSender};

/// Parsed activity type: a `[module, function]` pair, transported on the
/// wire as its JSON stringification (the same string activity stubs carry
/// as their `type`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityType {
    pub module: String,
    pub function: String,
}

impl ActivityType {
    pub fn parse(raw: &str) -> Result<Self, ActivityResolveError> {
        let pair: (String, String) = serde_json::from_str(raw)
            .map_err(|_| ActivityResolveError::MalformedType(raw.to_string()))?;
        Ok(Self {
            module: pair.0,
            function: pair.1,
        })
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(&(&self.module, &self.function))
            .expect("activity type pair serializes")
    }
}

/// Failures resolving an activity type to a registered function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivityResolveError {
    #[error("malformed activity type, expected [module, function] pair: {0}")]
    MalformedType(String),
    #[error("Activity module not found: {0}")]
    ModuleNotFound(String),
    #[error("Activity function not found: {module}.{function}")]
    FunctionNotFound { module: String, function: String },
}

/// Error an activity function resolves with.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    #[error("{message}")]
    Application {
        message: String,
        failure_type: String,
    },
    /// The activity observed its cancellation signal and stopped.
    #[error("activity cancelled")]
    Cancelled { details: Vec<serde_json::Value> },
}

impl ActivityError {
    pub fn application(message: impl Into<String>) -> Self {
        ActivityError::Application {
            message: message.into(),
            failure_type: "ApplicationFailure".to_string(),
        }
    }

    pub fn cancelled() -> Self {
        ActivityError::Cancelled { details: Vec::new() }
    }
}

/// A registered activity implementation.
pub type ActivityFn = Arc<
    dyn Fn(
            ActivityContext,
            Vec<serde_json::Value>,
        ) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>
        + Send
        + Sync,
>;

/// Activities known to this worker, keyed by module then function name.
/// Doubles as the stub roster input to the bundler.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    modules: HashMap<String, HashMap<String, ActivityFn>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, module: impl Into<String>, function: impl Into<String>, f: F)
    where
        F: Fn(ActivityContext, Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, ActivityError>>
            + Send
            + 'static,
    {
        let wrapped: ActivityFn = Arc::new(move |ctx, args| Box::pin(f(ctx, args)));
        self.modules
            .entry(module.into())
            .or_default()
            .insert(function.into(), wrapped);
    }

    pub fn resolve(&self, activity_type: &str) -> Result<(ActivityType, ActivityFn), ActivityResolveError> {
        let parsed = ActivityType::parse(activity_type)?;
        let module = self
            .modules
            .get(&parsed.module)
            .ok_or_else(|| ActivityResolveError::ModuleNotFound(parsed.module.clone()))?;
        let f = module
            .get(&parsed.function)
            .ok_or_else(|| ActivityResolveError::FunctionNotFound {
                module: parsed.module.clone(),
                function: parsed.function.clone(),
            })?;
        Ok((parsed, Arc::clone(f)))
    }

    /// Module specifier to exported function names, for stub generation.
    pub fn stub_roster(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.modules
            .iter()
            .map(|(module, functions)| {
                (module.clone(), functions.keys().cloned().collect())
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Immutable description of one activity attempt, exposed to the user
/// function and interceptors.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub attempt: u32,
    pub scheduled_time_ms: u64,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    /// Details recorded by the previous attempt's last heartbeat.
    pub heartbeat_details: Vec<serde_json::Value>,
    pub workflow_namespace: String,
    pub workflow_type: String,
    pub workflow_id: String,
    pub workflow_run_id: String,
    pub task_queue: String,
    /// The worker's configured activity namespace.
    pub namespace: String,
}

/// Handle to one running activity attempt, owned by its pipeline group.
pub struct ActivityHandle {
    task_token: Vec<u8>,
    activity_id: String,
    cancellation: CancellationToken,
    /// Liveness anchor; heartbeat emitters hold a weak reference.
    live: Arc<()>,
}

impl ActivityHandle {
    pub(crate) fn new(task_token: Vec<u8>, activity_id: String) -> Self {
        Self {
            task_token,
            activity_id,
            cancellation: CancellationToken::new(),
            live: Arc::new(()),
        }
    }

    pub fn task_token(&self) -> &[u8] {
        &self.task_token
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Signal cancellation. The user function decides when to honor it.
    pub fn cancel(&self, reason: &str) {
        debug!(activity_id = %self.activity_id, reason, "cancelling activity");
        self.cancellation.cancel();
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.live)
    }
}

/// Per-attempt context handed to the user function.
#[derive(Clone)]
pub struct ActivityContext {
    info: Arc<ActivityInfo>,
    task_token: Vec<u8>,
    cancellation: CancellationToken,
    heartbeats: HeartbeatSender,
    live: Weak<()>,
}

impl ActivityContext {
    pub(crate) fn new(
        info: Arc<ActivityInfo>,
        handle: &ActivityHandle,
        heartbeats: HeartbeatSender,
    ) -> Self {
        Self {
            info,
            task_token: handle.task_token.clone(),
            cancellation: handle.cancellation(),
            heartbeats,
            live: handle.liveness(),
        }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    /// Record progress. Enqueued onto the worker-wide heartbeat channel;
    /// delivery is fire-and-forget.
    pub fn heartbeat(&self, details: Vec<serde_json::Value>) {
        let record = HeartbeatRecord {
            task_token: self.task_token.clone(),
            details,
            live: self.live.clone(),
        };
        let _ = self.heartbeats.send(record);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
