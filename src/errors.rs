//! Worker error taxonomy.
//!
//! Errors are propagation-differentiated: some are recovered locally
//! (bridge shutdown, per-run completion rejections, decode failures inside
//! a run), some invalidate a single workflow run (eviction), and some are
//! fatal to the worker (invariant violations, transport failures, drain
//! deadline expiry). Fatal errors transition the worker to `Failed` and
//! become the rejection of [`Worker::run`](crate::Worker::run).

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::sandbox::{BundleError, SandboxError};

/// Internal invariant violation. Always fatal.
#[derive(Debug, Clone, Error)]
#[error("illegal state: {0}")]
pub struct IllegalStateError(pub String);

impl IllegalStateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("payload conversion failed: {0}")]
    Convert(String),
}

/// Top-level worker failure, as observed by [`Worker::run`](crate::Worker::run).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    IllegalState(#[from] IllegalStateError),

    /// The drain deadline elapsed before all in-flight work completed.
    #[error("graceful shutdown period of {grace_ms}ms expired before drain completed")]
    GracefulShutdownPeriodExpired { grace_ms: u64 },

    /// A bridge call failed with something other than a shutdown or a
    /// per-run workflow error.
    #[error("bridge failure: {0}")]
    Bridge(#[from] BridgeError),

    #[error("bundle failure: {0}")]
    Bundle(#[from] BundleError),

    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("invalid worker configuration: {0}")]
    Configuration(String),
}
