//! Deterministic workflow sandboxes.
//!
//! A sandbox is a wasmtime store instantiated from a pre-compiled bundle
//! snapshot. The linker defines only a fixed deterministic host ABI plus
//! the bundle's generated activity stubs; a workflow module importing
//! anything else (WASI clocks, native RNG, threads) fails to link. Time is
//! supplied per activation, randomness is seeded from the run's
//! `randomness_seed`, memory is capped per store, and every activation
//! runs under an epoch-based wall-clock deadline.

mod bundle;
mod pool;

pub use bundle::{
    BundleDiagnostic, BundleError, BundleOptions, SandboxBundler, WorkflowBundle,
    BUNDLE_FORMAT_VERSION,
};
pub use pool::{SandboxPool, SlotPermit};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, TypedFunc,
};

use crate::convert::{encode_all, DataConverter};
use crate::messages::{encode_message, failure_from_message};
use crate::proto::{
    workflow_activation_completion, workflow_activation_job, workflow_command,
    CancelWorkflowExecution, CompleteWorkflowExecution, FailWorkflowExecution, RespondToQuery,
    ScheduleActivityCommand, StartTimerCommand, WorkflowActivation, WorkflowActivationCompletion,
    WorkflowActivationSuccess, WorkflowCommand,
};

/// Engine epochs tick at this interval; activation deadlines are measured
/// in these ticks.
pub(crate) const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Import namespaces whose presence in a workflow module means it is
/// reaching for a non-deterministic primitive.
const NONDETERMINISTIC_NAMESPACES: &[&str] = &["wasi", "wasi_snapshot_preview1", "wasi:"];

/// Deadline used outside activations. Far enough out that the ticker never
/// reaches it, without risking wrap-around in the epoch arithmetic.
const IDLE_EPOCH_DEADLINE: u64 = u64::MAX / 2;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to compile bundle module `{module}`: {message}")]
    Compile { module: String, message: String },
    #[error("determinism violation: {0}")]
    DeterminismViolation(String),
    #[error("failed to link sandbox: {0}")]
    Link(String),
    #[error("sandbox interface is missing export `{0}`")]
    MissingExport(String),
    #[error("sandbox ABI fault: {0}")]
    Abi(String),
    #[error("activation exceeded the isolate execution timeout of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("workflow trapped: {0}")]
    Trap(String),
    #[error("malformed activation report: {0}")]
    Report(String),
    #[error("payload conversion failed: {0}")]
    Convert(String),
    #[error("sandbox pool is closed")]
    PoolClosed,
}

/// Error resolved by an injected host function; marshalled back into the
/// sandbox (or raised as a trap, depending on the apply mode).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HostFunctionError(pub String);

/// An injected host function: dynamic JSON in, dynamic JSON out.
pub type HostFn = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, HostFunctionError>>
        + Send
        + Sync,
>;

/// How an injected host function is applied inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Awaited; the return value is marshalled back; errors propagate as
    /// workflow traps.
    Sync,
    /// Fire-and-forget; errors are logged.
    SyncIgnored,
    /// Awaited; rejection is marshalled back as an error value.
    Async,
    /// Not awaited; errors are logged.
    AsyncIgnored,
}

/// Run metadata exposed to the sandboxed workflow.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub workflow_type: String,
    pub run_id: String,
    pub task_queue: String,
    pub namespace: String,
}

/// Per-sandbox creation options.
pub struct SandboxOptions {
    pub info: WorkflowInfo,
    pub random_seed: u64,
    pub is_replaying: bool,
    pub memory_mb: u64,
    /// Default timeout stamped onto activity commands issued by stubs.
    pub activity_start_to_close_timeout_ms: u64,
}

/// A command collected from the guest while applying an activation.
#[derive(Debug, Clone)]
enum CommandRecord {
    ScheduleActivity {
        seq: u32,
        activity_type: String,
        args: Vec<serde_json::Value>,
        start_to_close_timeout_ms: u64,
    },
    StartTimer {
        seq: u32,
        timeout_ms: u64,
    },
}

struct InjectedHostFn {
    f: HostFn,
    mode: ApplyMode,
    call_during_replay: bool,
}

/// Store data: limits, determinism state and collected commands.
struct SandboxCtx {
    limits: StoreLimits,
    rng: StdRng,
    now_ms: u64,
    is_replaying: bool,
    run_id: String,
    info_json: String,
    activity_timeout_ms: u64,
    commands: Vec<CommandRecord>,
    next_seq: u32,
    globals: HashMap<String, InjectedHostFn>,
    dependencies: HashMap<(String, String), InjectedHostFn>,
}

impl SandboxCtx {
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// One generated activity stub, bound into the linker under its module
/// specifier so workflow imports of that specifier resolve to a
/// `schedule_activity` forwarder.
#[derive(Debug, Clone)]
struct StubBinding {
    module: String,
    function: String,
    activity_type: String,
    start_to_close_timeout_ms: u64,
}

/// A compiled bundle: engine plus modules in roster order. Shared by every
/// pool slot; stores are created fresh per acquisition, which is what
/// makes sandbox startup cheap.
pub struct SandboxSnapshot {
    engine: Engine,
    modules: Vec<(String, Module)>,
    stubs: Vec<StubBinding>,
    interface: String,
    digest: String,
}

impl SandboxSnapshot {
    pub fn compile(bundle: &WorkflowBundle) -> Result<Arc<Self>, SandboxError> {
        let mut config = Config::new();
        config
            .async_support(true)
            .epoch_interruption(true)
            .cranelift_nan_canonicalization(true)
            .wasm_threads(false);
        let engine = Engine::new(&config)
            .map_err(|err| SandboxError::Link(format!("engine setup failed: {err}")))?;

        let manifest = bundle.manifest();
        let mut modules = Vec::with_capacity(manifest.entry.roster.len());
        for name in &manifest.entry.roster {
            let source = manifest.modules.get(name).ok_or_else(|| SandboxError::Compile {
                module: name.clone(),
                message: "module missing from bundle".to_string(),
            })?;
            let module = Module::new(&engine, source).map_err(|err| SandboxError::Compile {
                module: name.clone(),
                message: err.to_string(),
            })?;
            modules.push((name.clone(), module));
        }

        let mut stubs = Vec::new();
        for descriptor in manifest.stubs.values() {
            for (function, stub) in &descriptor.functions {
                stubs.push(StubBinding {
                    module: descriptor.specifier.clone(),
                    function: function.clone(),
                    activity_type: stub.activity_type.clone(),
                    start_to_close_timeout_ms: stub.start_to_close_timeout_ms,
                });
            }
        }

        info!(
            modules = modules.len(),
            stubs = stubs.len(),
            digest = %bundle.digest(),
            "sandbox snapshot compiled"
        );
        Ok(Arc::new(Self {
            engine,
            modules,
            stubs,
            interface: manifest.entry.interface.clone(),
            digest: bundle.digest().to_string(),
        }))
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Advances the shared engine epoch so activation deadlines fire. One per
/// snapshot; aborted on drop.
pub(crate) struct EpochTicker {
    handle: JoinHandle<()>,
}

impl EpochTicker {
    pub(crate) fn spawn(snapshot: &Arc<SandboxSnapshot>) -> Self {
        let engine = snapshot.engine.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EPOCH_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.increment_epoch();
            }
        });
        Self { handle }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Shape of the guest's activation report. The guest reports terminal
/// status and query results; scheduling side effects arrive separately
/// through the host ABI as collected commands.
#[derive(Debug, Deserialize)]
struct ActivationReport {
    #[serde(default)]
    status: Option<ReportStatus>,
    #[serde(default)]
    query_results: Vec<QueryResultReport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReportStatus {
    Completed {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed {
        message: String,
        #[serde(default)]
        failure_type: Option<String>,
        #[serde(default)]
        stack_trace: Option<String>,
    },
    Cancelled,
    Pending,
}

#[derive(Debug, Deserialize)]
struct QueryResultReport {
    query_id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// One deterministic execution context, exclusively owned by at most one
/// workflow handle at a time.
pub struct Sandbox {
    store: Store<SandboxCtx>,
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    activate: TypedFunc<(u32, u32), u64>,
    converter: Arc<dyn DataConverter>,
    run_id: String,
}

impl Sandbox {
    /// Instantiate the bundle inside a fresh store: install the
    /// deterministic host ABI and the activity stub bindings, lazily link
    /// the roster, then instantiate the interface module.
    pub async fn create(
        snapshot: &Arc<SandboxSnapshot>,
        options: SandboxOptions,
        converter: Arc<dyn DataConverter>,
    ) -> Result<Self, SandboxError> {
        let info_json = serde_json::json!({
            "workflowId": options.info.workflow_id,
            "workflowType": options.info.workflow_type,
            "runId": options.info.run_id,
            "taskQueue": options.info.task_queue,
            "namespace": options.info.namespace,
        })
        .to_string();

        let limits = StoreLimitsBuilder::new()
            .memory_size((options.memory_mb as usize) * 1024 * 1024)
            .instances(snapshot.modules.len() + 1)
            .tables(snapshot.modules.len() + 1)
            .build();

        let run_id = options.info.run_id.clone();
        let ctx = SandboxCtx {
            limits,
            rng: StdRng::seed_from_u64(options.random_seed),
            now_ms: 0,
            is_replaying: options.is_replaying,
            run_id: run_id.clone(),
            info_json,
            activity_timeout_ms: options.activity_start_to_close_timeout_ms,
            commands: Vec::new(),
            next_seq: 1,
            globals: HashMap::new(),
            dependencies: HashMap::new(),
        };

        let mut store = Store::new(&snapshot.engine, ctx);
        store.limiter(|ctx| &mut ctx.limits);
        store.set_epoch_deadline(IDLE_EPOCH_DEADLINE);

        let mut linker: Linker<SandboxCtx> = Linker::new(&snapshot.engine);
        define_host_abi(&mut linker)?;
        for stub in &snapshot.stubs {
            define_stub(&mut linker, stub)?;
        }

        for (name, module) in &snapshot.modules {
            if *name == snapshot.interface {
                continue;
            }
            linker
                .module_async(&mut store, name, module)
                .await
                .map_err(classify_link_error)?;
        }
        let interface = snapshot
            .modules
            .iter()
            .find(|(name, _)| *name == snapshot.interface)
            .map(|(_, module)| module)
            .ok_or_else(|| SandboxError::MissingExport(snapshot.interface.clone()))?;
        let instance = linker
            .instantiate_async(&mut store, interface)
            .await
            .map_err(classify_link_error)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| SandboxError::MissingExport("memory".to_string()))?;
        let alloc = instance
            .get_typed_func::<u32, u32>(&mut store, "alloc")
            .map_err(|_| SandboxError::MissingExport("alloc".to_string()))?;
        let activate = instance
            .get_typed_func::<(u32, u32), u64>(&mut store, "activate")
            .map_err(|_| SandboxError::MissingExport("activate".to_string()))?;

        debug!(run_id = %run_id, "sandbox created");
        Ok(Self {
            store,
            memory,
            alloc,
            activate,
            converter,
            run_id,
        })
    }

    /// Bind a host function as a sandbox global, reachable through the
    /// `host.invoke_global` trampoline.
    pub fn inject_global(&mut self, name: impl Into<String>, f: HostFn, mode: ApplyMode) {
        self.store.data_mut().globals.insert(
            name.into(),
            InjectedHostFn {
                f,
                mode,
                call_during_replay: true,
            },
        );
    }

    /// Bind an external-dependency call. Unless `call_during_replay` is
    /// set, invocations made while an activation replays are skipped and
    /// resolve to null inside the sandbox.
    pub fn inject_dependency(
        &mut self,
        iface: impl Into<String>,
        function: impl Into<String>,
        f: HostFn,
        mode: ApplyMode,
        call_during_replay: bool,
    ) {
        self.store.data_mut().dependencies.insert(
            (iface.into(), function.into()),
            InjectedHostFn {
                f,
                mode,
                call_during_replay,
            },
        );
    }

    /// Feed one activation to the guest, run its jobs to quiescence or
    /// suspension under the wall-clock deadline, and return the encoded
    /// completion buffer.
    pub async fn activate(
        &mut self,
        activation: &WorkflowActivation,
        timeout: Duration,
    ) -> Result<Vec<u8>, SandboxError> {
        {
            let ctx = self.store.data_mut();
            ctx.now_ms = activation.timestamp_ms;
            ctx.is_replaying = activation.is_replaying;
            for job in &activation.jobs {
                if let Some(workflow_activation_job::Variant::UpdateRandomSeed(update)) =
                    &job.variant
                {
                    ctx.rng = StdRng::seed_from_u64(update.randomness_seed);
                }
            }
        }

        let encoded = encode_message(activation);
        let len = encoded.len() as u32;
        let guest_ptr = self
            .alloc
            .call_async(&mut self.store, len)
            .await
            .map_err(|err| map_guest_error(err, timeout))?;
        self.memory
            .write(&mut self.store, guest_ptr as usize, &encoded)
            .map_err(|err| SandboxError::Abi(format!("writing activation: {err}")))?;

        let ticks = (timeout.as_millis() as u64 / EPOCH_TICK.as_millis() as u64).max(1) + 1;
        self.store.set_epoch_deadline(ticks);
        let call = self
            .activate
            .call_async(&mut self.store, (guest_ptr, len))
            .await;
        self.store.set_epoch_deadline(IDLE_EPOCH_DEADLINE);
        let packed = call.map_err(|err| map_guest_error(err, timeout))?;

        let report_ptr = (packed >> 32) as u32;
        let report_len = packed as u32;
        let mut buf = vec![0u8; report_len as usize];
        self.memory
            .read(&self.store, report_ptr as usize, &mut buf)
            .map_err(|err| SandboxError::Abi(format!("reading activation report: {err}")))?;
        let report: ActivationReport = serde_json::from_slice(&buf)
            .map_err(|err| SandboxError::Report(err.to_string()))?;

        let commands = std::mem::take(&mut self.store.data_mut().commands);
        let completion = self.build_completion(&activation.run_id, report, commands).await?;
        Ok(encode_message(&completion))
    }

    /// Release the execution context. The store is discarded; nothing it
    /// held can leak into a later run.
    pub fn dispose(self) {
        debug!(run_id = %self.run_id, "sandbox disposed");
    }

    async fn build_completion(
        &self,
        run_id: &str,
        report: ActivationReport,
        commands: Vec<CommandRecord>,
    ) -> Result<WorkflowActivationCompletion, SandboxError> {
        let converter = &*self.converter;
        let mut wire_commands = Vec::with_capacity(commands.len() + 1);
        for command in commands {
            let variant = match command {
                CommandRecord::ScheduleActivity {
                    seq,
                    activity_type,
                    args,
                    start_to_close_timeout_ms,
                } => {
                    let arguments = encode_all(converter, &args)
                        .await
                        .map_err(|err| SandboxError::Convert(err.to_string()))?;
                    workflow_command::Variant::ScheduleActivity(ScheduleActivityCommand {
                        seq,
                        activity_type,
                        arguments,
                        start_to_close_timeout_ms,
                    })
                }
                CommandRecord::StartTimer { seq, timeout_ms } => {
                    workflow_command::Variant::StartTimer(StartTimerCommand { seq, timeout_ms })
                }
            };
            wire_commands.push(WorkflowCommand {
                variant: Some(variant),
            });
        }

        for query in report.query_results {
            let (result, failure) = match (query.result, query.error) {
                (_, Some(message)) => (None, Some(failure_from_message(message, "QueryFailure"))),
                (Some(value), None) => {
                    let payload = converter
                        .encode(&value)
                        .await
                        .map_err(|err| SandboxError::Convert(err.to_string()))?;
                    (Some(payload), None)
                }
                (None, None) => (None, None),
            };
            wire_commands.push(WorkflowCommand {
                variant: Some(workflow_command::Variant::RespondToQuery(RespondToQuery {
                    query_id: query.query_id,
                    result,
                    failure,
                })),
            });
        }

        let status = match report.status {
            Some(ReportStatus::Failed {
                message,
                failure_type,
                stack_trace,
            }) => {
                // The run failed from workflow code; the activation itself
                // still succeeded. Host-side faults (traps, timeouts) take
                // the failed-completion path in the pipeline instead.
                let mut failure = failure_from_message(
                    message,
                    failure_type.as_deref().unwrap_or("WorkflowExecutionFailure"),
                );
                if let Some(stack) = stack_trace {
                    failure.stack_trace = stack;
                }
                wire_commands.push(WorkflowCommand {
                    variant: Some(workflow_command::Variant::FailWorkflowExecution(
                        FailWorkflowExecution {
                            failure: Some(failure),
                        },
                    )),
                });
                workflow_activation_completion::Status::Successful(WorkflowActivationSuccess {
                    commands: wire_commands,
                    result: None,
                })
            }
            Some(ReportStatus::Completed { result }) => {
                let payload = match result {
                    Some(value) => Some(
                        converter
                            .encode(&value)
                            .await
                            .map_err(|err| SandboxError::Convert(err.to_string()))?,
                    ),
                    None => None,
                };
                wire_commands.push(WorkflowCommand {
                    variant: Some(workflow_command::Variant::CompleteWorkflowExecution(
                        CompleteWorkflowExecution {
                            result: payload.clone(),
                        },
                    )),
                });
                workflow_activation_completion::Status::Successful(WorkflowActivationSuccess {
                    commands: wire_commands,
                    result: payload,
                })
            }
            Some(ReportStatus::Cancelled) => {
                wire_commands.push(WorkflowCommand {
                    variant: Some(workflow_command::Variant::CancelWorkflowExecution(
                        CancelWorkflowExecution {},
                    )),
                });
                workflow_activation_completion::Status::Successful(WorkflowActivationSuccess {
                    commands: wire_commands,
                    result: None,
                })
            }
            Some(ReportStatus::Pending) | None => {
                workflow_activation_completion::Status::Successful(WorkflowActivationSuccess {
                    commands: wire_commands,
                    result: None,
                })
            }
        };

        Ok(WorkflowActivationCompletion {
            run_id: run_id.to_string(),
            status: Some(status),
        })
    }
}

/// Read `len` bytes at `ptr` out of the caller's exported memory.
fn read_guest_bytes(
    caller: &mut Caller<'_, SandboxCtx>,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| wasmtime::Error::msg("guest pointer overflow"))?;
    data.get(start..end)
        .map(|slice| slice.to_vec())
        .ok_or_else(|| wasmtime::Error::msg("guest pointer out of bounds"))
}

fn guest_memory(caller: &mut Caller<'_, SandboxCtx>) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(wasmtime::Error::msg("guest does not export memory")),
    }
}

/// Write a response into the guest-provided buffer. Returns the byte count
/// on success or the negated required size when the buffer is too small
/// (the guest retries with a larger one).
fn write_guest_response(
    caller: &mut Caller<'_, SandboxCtx>,
    ret_ptr: u32,
    ret_cap: u32,
    bytes: &[u8],
) -> wasmtime::Result<i64> {
    if bytes.len() > ret_cap as usize {
        return Ok(-(bytes.len() as i64));
    }
    let memory = guest_memory(caller)?;
    memory
        .write(caller, ret_ptr as usize, bytes)
        .map_err(|err| wasmtime::Error::msg(format!("writing host response: {err}")))?;
    Ok(bytes.len() as i64)
}

fn parse_args(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
}

/// Apply an injected host function under its apply mode and produce the
/// response JSON handed back to the guest, or a trap for `Sync` errors.
async fn apply_injected(
    f: HostFn,
    mode: ApplyMode,
    args: serde_json::Value,
    label: String,
) -> wasmtime::Result<serde_json::Value> {
    match mode {
        ApplyMode::Sync => match f(args).await {
            Ok(value) => Ok(serde_json::json!({ "ok": value })),
            Err(err) => Err(wasmtime::Error::msg(format!("{label}: {err}"))),
        },
        ApplyMode::Async => match f(args).await {
            Ok(value) => Ok(serde_json::json!({ "ok": value })),
            Err(err) => Ok(serde_json::json!({ "err": err.to_string() })),
        },
        ApplyMode::SyncIgnored => {
            if let Err(err) = f(args).await {
                warn!(%label, %err, "ignored host function failed");
            }
            Ok(serde_json::json!({ "ok": null }))
        }
        ApplyMode::AsyncIgnored => {
            tokio::spawn(async move {
                if let Err(err) = f(args).await {
                    warn!(%label, %err, "ignored host function failed");
                }
            });
            Ok(serde_json::json!({ "ok": null }))
        }
    }
}

/// The fixed deterministic host ABI every bundle links against.
fn define_host_abi(linker: &mut Linker<SandboxCtx>) -> Result<(), SandboxError> {
    let link = |err: wasmtime::Error| SandboxError::Link(err.to_string());

    linker
        .func_wrap("host", "now", |caller: Caller<'_, SandboxCtx>| -> u64 {
            caller.data().now_ms
        })
        .map_err(link)?;

    linker
        .func_wrap("host", "random", |mut caller: Caller<'_, SandboxCtx>| -> f64 {
            caller.data_mut().rng.gen::<f64>()
        })
        .map_err(link)?;

    linker
        .func_wrap(
            "host",
            "log",
            |mut caller: Caller<'_, SandboxCtx>,
             level: u32,
             ptr: u32,
             len: u32|
             -> wasmtime::Result<()> {
                let bytes = read_guest_bytes(&mut caller, ptr, len)?;
                let message = String::from_utf8_lossy(&bytes);
                let run_id = caller.data().run_id.clone();
                match level {
                    0 => debug!(run_id = %run_id, "workflow: {message}"),
                    1 => info!(run_id = %run_id, "workflow: {message}"),
                    2 => warn!(run_id = %run_id, "workflow: {message}"),
                    _ => error!(run_id = %run_id, "workflow: {message}"),
                }
                Ok(())
            },
        )
        .map_err(link)?;

    linker
        .func_wrap(
            "host",
            "start_timer",
            |mut caller: Caller<'_, SandboxCtx>, timeout_ms: u64| -> u32 {
                let ctx = caller.data_mut();
                let seq = ctx.next_seq();
                ctx.commands.push(CommandRecord::StartTimer { seq, timeout_ms });
                seq
            },
        )
        .map_err(link)?;

    linker
        .func_wrap(
            "host",
            "schedule_activity",
            |mut caller: Caller<'_, SandboxCtx>,
             ty_ptr: u32,
             ty_len: u32,
             args_ptr: u32,
             args_len: u32|
             -> wasmtime::Result<u32> {
                let ty_bytes = read_guest_bytes(&mut caller, ty_ptr, ty_len)?;
                let activity_type = String::from_utf8(ty_bytes)
                    .map_err(|_| wasmtime::Error::msg("activity type is not utf-8"))?;
                let args_bytes = read_guest_bytes(&mut caller, args_ptr, args_len)?;
                let args = match parse_args(&args_bytes) {
                    serde_json::Value::Array(items) => items,
                    serde_json::Value::Null => Vec::new(),
                    other => vec![other],
                };
                let ctx = caller.data_mut();
                let seq = ctx.next_seq();
                let start_to_close_timeout_ms = ctx.activity_timeout_ms;
                ctx.commands.push(CommandRecord::ScheduleActivity {
                    seq,
                    activity_type,
                    args,
                    start_to_close_timeout_ms,
                });
                Ok(seq)
            },
        )
        .map_err(link)?;

    linker
        .func_wrap(
            "host",
            "workflow_info",
            |mut caller: Caller<'_, SandboxCtx>, ret_ptr: u32, ret_cap: u32| -> wasmtime::Result<i64> {
                let info = caller.data().info_json.clone();
                write_guest_response(&mut caller, ret_ptr, ret_cap, info.as_bytes())
            },
        )
        .map_err(link)?;

    linker
        .func_wrap_async(
            "host",
            "invoke_global",
            |mut caller: Caller<'_, SandboxCtx>,
             (name_ptr, name_len, args_ptr, args_len, ret_ptr, ret_cap): (
                u32,
                u32,
                u32,
                u32,
                u32,
                u32,
            )| {
                Box::new(async move {
                    let name_bytes = read_guest_bytes(&mut caller, name_ptr, name_len)?;
                    let name = String::from_utf8_lossy(&name_bytes).into_owned();
                    let args_bytes = read_guest_bytes(&mut caller, args_ptr, args_len)?;
                    let args = parse_args(&args_bytes);

                    let Some((f, mode)) = caller
                        .data()
                        .globals
                        .get(&name)
                        .map(|g| (Arc::clone(&g.f), g.mode))
                    else {
                        return Err(wasmtime::Error::msg(format!(
                            "no injected global named `{name}`"
                        )));
                    };
                    let response = apply_injected(f, mode, args, format!("global {name}")).await?;
                    let bytes = serde_json::to_vec(&response)
                        .map_err(|err| wasmtime::Error::msg(err.to_string()))?;
                    write_guest_response(&mut caller, ret_ptr, ret_cap, &bytes)
                })
            },
        )
        .map_err(link)?;

    linker
        .func_wrap_async(
            "host",
            "invoke_dependency",
            |mut caller: Caller<'_, SandboxCtx>,
             (iface_ptr, iface_len, fn_ptr, fn_len, args_ptr, args_len, ret_ptr, ret_cap): (
                u32,
                u32,
                u32,
                u32,
                u32,
                u32,
                u32,
                u32,
            )| {
                Box::new(async move {
                    let iface_bytes = read_guest_bytes(&mut caller, iface_ptr, iface_len)?;
                    let iface = String::from_utf8_lossy(&iface_bytes).into_owned();
                    let fn_bytes = read_guest_bytes(&mut caller, fn_ptr, fn_len)?;
                    let function = String::from_utf8_lossy(&fn_bytes).into_owned();
                    let args_bytes = read_guest_bytes(&mut caller, args_ptr, args_len)?;
                    let args = parse_args(&args_bytes);

                    let key = (iface.clone(), function.clone());
                    let Some((f, mode, call_during_replay)) = caller
                        .data()
                        .dependencies
                        .get(&key)
                        .map(|d| (Arc::clone(&d.f), d.mode, d.call_during_replay))
                    else {
                        return Err(wasmtime::Error::msg(format!(
                            "no injected dependency `{iface}.{function}`"
                        )));
                    };
                    if caller.data().is_replaying && !call_during_replay {
                        let skipped = serde_json::json!({ "ok": null });
                        let bytes = serde_json::to_vec(&skipped)
                            .map_err(|err| wasmtime::Error::msg(err.to_string()))?;
                        return write_guest_response(&mut caller, ret_ptr, ret_cap, &bytes);
                    }
                    let response =
                        apply_injected(f, mode, args, format!("dependency {iface}.{function}"))
                            .await?;
                    let bytes = serde_json::to_vec(&response)
                        .map_err(|err| wasmtime::Error::msg(err.to_string()))?;
                    write_guest_response(&mut caller, ret_ptr, ret_cap, &bytes)
                })
            },
        )
        .map_err(link)?;

    Ok(())
}

/// Bind one generated activity stub under its module specifier.
fn define_stub(linker: &mut Linker<SandboxCtx>, stub: &StubBinding) -> Result<(), SandboxError> {
    let activity_type = stub.activity_type.clone();
    let timeout_ms = stub.start_to_close_timeout_ms;
    linker
        .func_wrap(
            stub.module.as_str(),
            stub.function.as_str(),
            move |mut caller: Caller<'_, SandboxCtx>,
                  args_ptr: u32,
                  args_len: u32|
                  -> wasmtime::Result<u32> {
                let args_bytes = read_guest_bytes(&mut caller, args_ptr, args_len)?;
                let args = match parse_args(&args_bytes) {
                    serde_json::Value::Array(items) => items,
                    serde_json::Value::Null => Vec::new(),
                    other => vec![other],
                };
                let ctx = caller.data_mut();
                let seq = ctx.next_seq();
                ctx.commands.push(CommandRecord::ScheduleActivity {
                    seq,
                    activity_type: activity_type.clone(),
                    args,
                    start_to_close_timeout_ms: timeout_ms,
                });
                Ok(seq)
            },
        )
        .map_err(|err| SandboxError::Link(err.to_string()))?;
    Ok(())
}

/// Split link failures into determinism violations (imports of known
/// non-deterministic namespaces) and plain link errors.
fn classify_link_error(err: wasmtime::Error) -> SandboxError {
    let message = format!("{err:#}");
    let lowered = message.to_lowercase();
    if NONDETERMINISTIC_NAMESPACES
        .iter()
        .any(|ns| lowered.contains(ns))
    {
        SandboxError::DeterminismViolation(message)
    } else {
        SandboxError::Link(message)
    }
}

/// Map guest call failures: epoch interrupts become timeouts, everything
/// else is a trap.
fn map_guest_error(err: wasmtime::Error, timeout: Duration) -> SandboxError {
    if let Some(trap) = err.downcast_ref::<Trap>() {
        if matches!(trap, Trap::Interrupt) {
            return SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            };
        }
    }
    SandboxError::Trap(format!("{err:#}"))
}
