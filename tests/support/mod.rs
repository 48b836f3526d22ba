//! Integration test harness: an in-memory bridge plus worker fixtures.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use belay::bridge::{BridgeError, WorkerBridge};
use belay::messages::{decode_framed, encode_framed};
use belay::proto::{
    activity_task, workflow_activation_job, ActivityCancel, ActivityHeartbeat, ActivityStart,
    ActivityTask, ActivityTaskCompletion, StartWorkflow, WorkflowActivation,
    WorkflowActivationCompletion, WorkflowActivationJob,
};
use belay::{ActivityRegistry, Worker, WorkerConfig};

const POLL_IDLE: Duration = Duration::from_millis(5);

/// Scripted bridge: tests push encoded tasks in, completions accumulate.
/// Polls long-poll until a task arrives or the bridge starts draining.
pub struct InMemoryBridge {
    workflow_queue: Mutex<VecDeque<Vec<u8>>>,
    activity_queue: Mutex<VecDeque<Vec<u8>>>,
    draining: AtomicBool,
    pub workflow_polls: AtomicUsize,
    pub activity_polls: AtomicUsize,
    workflow_completions: Mutex<Vec<WorkflowActivationCompletion>>,
    activity_completions: Mutex<Vec<ActivityTaskCompletion>>,
    heartbeats: Mutex<Vec<ActivityHeartbeat>>,
    /// Run ids whose next workflow completion is rejected with a per-run
    /// error.
    reject_runs: Mutex<HashSet<String>>,
    pub shutdown_completed: AtomicBool,
}

impl InMemoryBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workflow_queue: Mutex::new(VecDeque::new()),
            activity_queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            workflow_polls: AtomicUsize::new(0),
            activity_polls: AtomicUsize::new(0),
            workflow_completions: Mutex::new(Vec::new()),
            activity_completions: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
            reject_runs: Mutex::new(HashSet::new()),
            shutdown_completed: AtomicBool::new(false),
        })
    }

    pub fn push_activation(&self, activation: WorkflowActivation) {
        self.workflow_queue
            .lock()
            .unwrap()
            .push_back(encode_framed(&activation));
    }

    pub fn push_activity_task(&self, task: ActivityTask) {
        self.activity_queue
            .lock()
            .unwrap()
            .push_back(encode_framed(&task));
    }

    /// Reject the next workflow completion for `run_id` with a per-run
    /// `WorkflowError`.
    pub fn reject_next_completion(&self, run_id: &str) {
        self.reject_runs.lock().unwrap().insert(run_id.to_string());
    }

    pub fn workflow_completions(&self) -> Vec<WorkflowActivationCompletion> {
        self.workflow_completions.lock().unwrap().clone()
    }

    pub fn activity_completions(&self) -> Vec<ActivityTaskCompletion> {
        self.activity_completions.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> Vec<ActivityHeartbeat> {
        self.heartbeats.lock().unwrap().clone()
    }

    async fn poll(
        &self,
        queue: &Mutex<VecDeque<Vec<u8>>>,
        counter: &AtomicUsize,
    ) -> Result<Vec<u8>, BridgeError> {
        counter.fetch_add(1, Ordering::SeqCst);
        loop {
            if let Some(bytes) = queue.lock().unwrap().pop_front() {
                return Ok(bytes);
            }
            if self.draining.load(Ordering::SeqCst) {
                return Err(BridgeError::Shutdown);
            }
            tokio::time::sleep(POLL_IDLE).await;
        }
    }
}

impl WorkerBridge for InMemoryBridge {
    fn poll_workflow_activation(&self) -> BoxFuture<'_, Result<Vec<u8>, BridgeError>> {
        Box::pin(self.poll(&self.workflow_queue, &self.workflow_polls))
    }

    fn poll_activity_task(&self) -> BoxFuture<'_, Result<Vec<u8>, BridgeError>> {
        Box::pin(self.poll(&self.activity_queue, &self.activity_polls))
    }

    fn complete_workflow_activation(
        &self,
        completion: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            let decoded: WorkflowActivationCompletion = decode_framed(&completion)
                .map_err(|err| BridgeError::Transport(err.to_string()))?;
            if self.reject_runs.lock().unwrap().remove(&decoded.run_id) {
                return Err(BridgeError::Workflow {
                    run_id: decoded.run_id,
                    message: "workflow task rejected by server".to_string(),
                });
            }
            self.workflow_completions.lock().unwrap().push(decoded);
            Ok(())
        })
    }

    fn complete_activity_task(&self, completion: Vec<u8>) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            let decoded: ActivityTaskCompletion = decode_framed(&completion)
                .map_err(|err| BridgeError::Transport(err.to_string()))?;
            self.activity_completions.lock().unwrap().push(decoded);
            Ok(())
        })
    }

    fn record_activity_heartbeat(&self, heartbeat: Vec<u8>) -> Result<(), BridgeError> {
        let decoded: ActivityHeartbeat =
            decode_framed(&heartbeat).map_err(|err| BridgeError::Transport(err.to_string()))?;
        self.heartbeats.lock().unwrap().push(decoded);
        Ok(())
    }

    fn initiate_shutdown(&self) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            self.draining.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn complete_shutdown(&self) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            self.shutdown_completed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Interface module whose `activate` returns a fixed report.
pub fn static_report_interface(report: &str) -> String {
    let data = report.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"(module
  (memory (export "memory") 2)
  (data (i32.const 2048) "{data}")
  (global $bump (mut i32) (i32.const 65536))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $bump
    local.set $ptr
    global.get $bump
    local.get $len
    i32.add
    global.set $bump
    local.get $ptr)
  (func (export "activate") (param i32 i32) (result i64)
    (i64.or (i64.shl (i64.const 2048) (i64.const 32)) (i64.const {len}))))
"#,
        len = report.len()
    )
}

/// Interface module whose `activate` never returns.
pub fn spinning_interface() -> String {
    r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 4096))
  (func (export "activate") (param i32 i32) (result i64)
    (loop $spin (br $spin))
    (i64.const 0)))
"#
    .to_string()
}

/// A workflows directory containing only the given interface module.
pub fn workflows_dir(interface_wat: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("workflow-interface.wat"), interface_wat).unwrap();
    dir
}

pub fn test_config(workflows: &Path) -> WorkerConfig {
    WorkerConfig::new("test-queue", workflows)
        .with_isolate_pool_size(4)
        .with_max_isolate_memory_mb(64)
}

pub fn build_worker(
    config: WorkerConfig,
    bridge: &Arc<InMemoryBridge>,
    registry: ActivityRegistry,
) -> Arc<Worker> {
    let bridge: Arc<dyn WorkerBridge> = Arc::clone(bridge) as Arc<dyn WorkerBridge>;
    Arc::new(Worker::new(config, bridge, registry).unwrap())
}

pub fn start_activation(run_id: &str, workflow_type: &str) -> WorkflowActivation {
    WorkflowActivation {
        run_id: run_id.to_string(),
        timestamp_ms: 1_700_000_000_000,
        is_replaying: false,
        jobs: vec![WorkflowActivationJob {
            variant: Some(workflow_activation_job::Variant::StartWorkflow(
                StartWorkflow {
                    workflow_id: format!("{run_id}-wf"),
                    workflow_type: workflow_type.to_string(),
                    randomness_seed: 7,
                    arguments: vec![],
                    headers: Default::default(),
                },
            )),
        }],
    }
}

pub fn jobs_activation(
    run_id: &str,
    variants: Vec<workflow_activation_job::Variant>,
) -> WorkflowActivation {
    WorkflowActivation {
        run_id: run_id.to_string(),
        timestamp_ms: 1_700_000_000_100,
        is_replaying: false,
        jobs: variants
            .into_iter()
            .map(|variant| WorkflowActivationJob {
                variant: Some(variant),
            })
            .collect(),
    }
}

pub fn activity_start_task(token: &[u8], activity_type: &str, input: Vec<serde_json::Value>) -> ActivityTask {
    let payloads = input
        .iter()
        .map(|value| belay::messages::json_payload(value).unwrap())
        .collect();
    ActivityTask {
        task_token: token.to_vec(),
        activity_id: format!("activity-{}", token.first().copied().unwrap_or(0)),
        variant: Some(activity_task::Variant::Start(ActivityStart {
            workflow_namespace: "default".to_string(),
            workflow_type: "order".to_string(),
            workflow_run_id: "r1".to_string(),
            workflow_id: "w1".to_string(),
            activity_type: activity_type.to_string(),
            header: Default::default(),
            input: payloads,
            heartbeat_details: vec![],
            scheduled_time_ms: 1_700_000_000_000,
            attempt: 1,
            schedule_to_close_timeout_ms: 0,
            start_to_close_timeout_ms: 30_000,
            heartbeat_timeout_ms: 5_000,
        })),
    }
}

pub fn activity_cancel_task(token: &[u8]) -> ActivityTask {
    ActivityTask {
        task_token: token.to_vec(),
        activity_id: String::new(),
        variant: Some(activity_task::Variant::Cancel(ActivityCancel {
            reason: "workflow cancelled".to_string(),
        })),
    }
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
