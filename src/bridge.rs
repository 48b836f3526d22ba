//! Bridge adapter.
//!
//! The bridge owns the transport to the orchestration service; the worker
//! only sees promise-style calls that move length-delimited protobuf
//! buffers. Implementations adapt whatever callback-style native surface
//! the deployment uses.

use futures::future::BoxFuture;
use thiserror::Error;

/// Errors surfaced by bridge calls.
///
/// `Shutdown` and `Workflow` are recovered by the pipelines; anything else
/// is fatal to the worker.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The bridge is draining; polls will never yield another task.
    /// Converted into stream completion by the poll loops.
    #[error("bridge is shutting down")]
    Shutdown,

    /// A completion was rejected for a single workflow run. The run is
    /// evicted; the worker carries on.
    #[error("workflow task failed for run {run_id}: {message}")]
    Workflow { run_id: String, message: String },

    /// Transport-level failure. Fatal.
    #[error("bridge transport failure: {0}")]
    Transport(String),
}

/// Promise-style adapter over the native bridge.
///
/// All byte arguments and results are length-delimited protobuf buffers;
/// the worker decodes and encodes at pipeline boundaries and otherwise
/// treats them as opaque.
pub trait WorkerBridge: Send + Sync {
    /// Long-poll for the next workflow activation.
    fn poll_workflow_activation(&self) -> BoxFuture<'_, Result<Vec<u8>, BridgeError>>;

    /// Long-poll for the next activity task.
    fn poll_activity_task(&self) -> BoxFuture<'_, Result<Vec<u8>, BridgeError>>;

    /// Report the outcome of one workflow activation.
    fn complete_workflow_activation(
        &self,
        completion: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), BridgeError>>;

    /// Report the terminal outcome of one activity attempt.
    fn complete_activity_task(&self, completion: Vec<u8>) -> BoxFuture<'_, Result<(), BridgeError>>;

    /// Forward an activity heartbeat. Fire-and-forget: the bridge buffers
    /// and coalesces; errors are reported out-of-band.
    fn record_activity_heartbeat(&self, heartbeat: Vec<u8>) -> Result<(), BridgeError>;

    /// Signal server-side drain. After this resolves, polls eventually
    /// return [`BridgeError::Shutdown`].
    fn initiate_shutdown(&self) -> BoxFuture<'_, Result<(), BridgeError>>;

    /// De-register the worker from the bridge. Called exactly once, after
    /// the pipelines have closed (or the worker failed).
    fn complete_shutdown(&self) -> BoxFuture<'_, Result<(), BridgeError>>;
}

impl BridgeError {
    /// Whether this error is fatal to the worker (neither a drain signal
    /// nor a per-run rejection).
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Transport(_))
    }
}
