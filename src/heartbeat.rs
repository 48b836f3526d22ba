//! Activity heartbeat channel.
//!
//! Heartbeats from all running activities funnel into one unbounded queue
//! drained by a single forwarder task. The channel closes when the worker
//! reaches `DRAINED`; no activities can be in flight by then, so the queue
//! is empty.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::WorkerBridge;
use crate::convert::{encode_all, DataConverter};
use crate::lifecycle::WorkerState;
use crate::messages::encode_framed;
use crate::proto::ActivityHeartbeat;

/// One heartbeat emitted by an activity's user-visible callback.
pub struct HeartbeatRecord {
    pub task_token: Vec<u8>,
    pub details: Vec<serde_json::Value>,
    /// Liveness marker of the owning activity handle. Beats that outlive
    /// their activity are dropped instead of forwarded.
    pub(crate) live: Weak<()>,
}

pub(crate) type HeartbeatSender = mpsc::UnboundedSender<HeartbeatRecord>;

pub(crate) fn heartbeat_channel() -> (HeartbeatSender, mpsc::UnboundedReceiver<HeartbeatRecord>) {
    mpsc::unbounded_channel()
}

/// Consume the heartbeat queue, encode each record and hand it to the
/// bridge fire-and-forget. Exits when the lifecycle reaches `DRAINED` or a
/// terminal state, or when all senders are gone.
pub(crate) fn spawn_heartbeat_forwarder(
    mut rx: mpsc::UnboundedReceiver<HeartbeatRecord>,
    bridge: Arc<dyn WorkerBridge>,
    converter: Arc<dyn DataConverter>,
    mut state_rx: watch::Receiver<WorkerState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                record = rx.recv() => {
                    let Some(record) = record else { break };
                    forward(&*bridge, &*converter, record).await;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow();
                    if matches!(
                        state,
                        WorkerState::Drained | WorkerState::Stopped | WorkerState::Failed
                    ) {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat channel closed");
    })
}

async fn forward(bridge: &dyn WorkerBridge, converter: &dyn DataConverter, record: HeartbeatRecord) {
    if record.live.upgrade().is_none() {
        debug!("dropping heartbeat for finished activity");
        return;
    }
    let details = match encode_all(converter, &record.details).await {
        Ok(details) => details,
        Err(err) => {
            warn!(%err, "failed to encode heartbeat details, dropping heartbeat");
            return;
        }
    };
    let heartbeat = ActivityHeartbeat {
        task_token: record.task_token,
        details,
    };
    metrics::counter!("belay_activity_heartbeats_total").increment(1);
    if let Err(err) = bridge.record_activity_heartbeat(encode_framed(&heartbeat)) {
        warn!(%err, "bridge rejected activity heartbeat");
    }
}
