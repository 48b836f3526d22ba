//! Belay - the core of a durable-execution worker.
//!
//! A [`Worker`] is a long-lived, stateless processor between an
//! orchestration service and user code. It pulls two kinds of work from a
//! [`bridge`](bridge::WorkerBridge) - workflow activations and activity
//! tasks - executes them with the required concurrency and isolation
//! guarantees, and reports completions back. The key pieces:
//!
//! - [`lifecycle`]: the eight-state machine gating polling, suspension,
//!   graceful drain and failure
//! - [`pipeline`]: the two backpressured pipelines that bucket tasks by
//!   identity and serialize per-group work
//! - [`sandbox`]: deterministic, memory-capped wasmtime sandboxes, pooled
//!   round-robin and seeded from a pre-compiled bundle snapshot
//! - [`sandbox::SandboxBundler`]: the offline step that synthesizes the
//!   bundle from a workflows directory plus generated activity stubs
//! - [`activity`]: per-task-token activity state, cancellation and
//!   heartbeat plumbing

pub mod activity;
pub mod bridge;
pub mod config;
pub mod convert;
pub mod errors;
pub mod heartbeat;
pub mod lifecycle;
pub mod messages;
pub mod pipeline;
pub mod proto;
pub mod sandbox;
mod worker;

pub use activity::{
    ActivityContext, ActivityError, ActivityInboundInterceptor, ActivityInfo, ActivityRegistry,
    ActivityType,
};
pub use bridge::{BridgeError, WorkerBridge};
pub use config::{
    ActivityDefaults, ActivityKind, InjectedDependency, InjectedFunction, InterceptorOptions,
    ShutdownSignal, WorkerConfig,
};
pub use convert::{DataConverter, JsonDataConverter};
pub use errors::{IllegalStateError, MessageError, WorkerError};
pub use lifecycle::WorkerState;
pub use sandbox::{
    ApplyMode, BundleError, BundleOptions, HostFn, SandboxBundler, SandboxError, WorkflowBundle,
};
pub use worker::Worker;
