//! Wire message types for the worker protocol.
//!
//! These mirror the orchestration service's protobuf schemas for the slice
//! of the protocol the worker touches: workflow activations in, activation
//! completions out, activity tasks in, activity completions and heartbeats
//! out. The transport itself lives behind the bridge and never sees these
//! as anything but length-delimited byte buffers, so the message structs
//! carry `prost` derives directly rather than a codegen build step.

use std::collections::HashMap;

/// A single serialized value plus codec metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(map = "string, bytes", tag = "1")]
    pub metadata: HashMap<String, Vec<u8>>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Wire representation of an error, with a recursive cause chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Failure {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub stack_trace: String,
    #[prost(string, tag = "3")]
    pub failure_type: String,
    #[prost(message, optional, boxed, tag = "4")]
    pub cause: Option<Box<Failure>>,
}

/// A batch of jobs the orchestration service asks a workflow run to apply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowActivation {
    /// Stable identifier of the workflow run this activation targets.
    #[prost(string, tag = "1")]
    pub run_id: String,
    /// Logical wall-clock time of the activation, in epoch milliseconds.
    /// This is the only time source the sandbox observes.
    #[prost(uint64, tag = "2")]
    pub timestamp_ms: u64,
    #[prost(bool, tag = "3")]
    pub is_replaying: bool,
    #[prost(message, repeated, tag = "4")]
    pub jobs: Vec<WorkflowActivationJob>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowActivationJob {
    #[prost(
        oneof = "workflow_activation_job::Variant",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9"
    )]
    pub variant: Option<workflow_activation_job::Variant>,
}

pub mod workflow_activation_job {
    /// The job variants an activation can carry. A new variant is a
    /// compile-time obligation for every match over activation jobs.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "1")]
        StartWorkflow(super::StartWorkflow),
        #[prost(message, tag = "2")]
        FireTimer(super::FireTimer),
        #[prost(message, tag = "3")]
        ResolveActivity(super::ResolveActivity),
        #[prost(message, tag = "4")]
        SignalWorkflow(super::SignalWorkflow),
        #[prost(message, tag = "5")]
        QueryWorkflow(super::QueryWorkflow),
        #[prost(message, tag = "6")]
        CancelWorkflow(super::CancelWorkflow),
        #[prost(message, tag = "7")]
        UpdateRandomSeed(super::UpdateRandomSeed),
        #[prost(message, tag = "8")]
        NotifyHasChange(super::NotifyHasChange),
        #[prost(message, tag = "9")]
        RemoveFromCache(super::RemoveFromCache),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartWorkflow {
    #[prost(string, tag = "1")]
    pub workflow_id: String,
    #[prost(string, tag = "2")]
    pub workflow_type: String,
    #[prost(uint64, tag = "3")]
    pub randomness_seed: u64,
    #[prost(message, repeated, tag = "4")]
    pub arguments: Vec<Payload>,
    #[prost(map = "string, message", tag = "5")]
    pub headers: HashMap<String, Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FireTimer {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResolveActivity {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(message, optional, tag = "2")]
    pub result: Option<ActivityResolution>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityResolution {
    #[prost(oneof = "activity_resolution::Status", tags = "1, 2, 3")]
    pub status: Option<activity_resolution::Status>,
}

pub mod activity_resolution {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Status {
        #[prost(message, tag = "1")]
        Completed(super::ActivityResultCompleted),
        #[prost(message, tag = "2")]
        Failed(super::ActivityResultFailed),
        #[prost(message, tag = "3")]
        Cancelled(super::ActivityResultCancelled),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalWorkflow {
    #[prost(string, tag = "1")]
    pub signal_name: String,
    #[prost(message, repeated, tag = "2")]
    pub input: Vec<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryWorkflow {
    #[prost(string, tag = "1")]
    pub query_id: String,
    #[prost(string, tag = "2")]
    pub query_type: String,
    #[prost(message, repeated, tag = "3")]
    pub arguments: Vec<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelWorkflow {
    #[prost(string, tag = "1")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRandomSeed {
    #[prost(uint64, tag = "1")]
    pub randomness_seed: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotifyHasChange {
    #[prost(string, tag = "1")]
    pub patch_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveFromCache {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Outcome of applying one activation to a workflow run.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowActivationCompletion {
    #[prost(string, tag = "1")]
    pub run_id: String,
    #[prost(oneof = "workflow_activation_completion::Status", tags = "2, 3")]
    pub status: Option<workflow_activation_completion::Status>,
}

pub mod workflow_activation_completion {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Status {
        #[prost(message, tag = "2")]
        Successful(super::WorkflowActivationSuccess),
        #[prost(message, tag = "3")]
        Failed(super::WorkflowActivationFailure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowActivationSuccess {
    #[prost(message, repeated, tag = "1")]
    pub commands: Vec<WorkflowCommand>,
    #[prost(message, optional, tag = "2")]
    pub result: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowActivationFailure {
    #[prost(message, optional, tag = "1")]
    pub failure: Option<Failure>,
}

/// A command the workflow issued while applying an activation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkflowCommand {
    #[prost(oneof = "workflow_command::Variant", tags = "1, 2, 3, 4, 5, 6")]
    pub variant: Option<workflow_command::Variant>,
}

pub mod workflow_command {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "1")]
        ScheduleActivity(super::ScheduleActivityCommand),
        #[prost(message, tag = "2")]
        StartTimer(super::StartTimerCommand),
        #[prost(message, tag = "3")]
        CompleteWorkflowExecution(super::CompleteWorkflowExecution),
        #[prost(message, tag = "4")]
        FailWorkflowExecution(super::FailWorkflowExecution),
        #[prost(message, tag = "5")]
        CancelWorkflowExecution(super::CancelWorkflowExecution),
        #[prost(message, tag = "6")]
        RespondToQuery(super::RespondToQuery),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleActivityCommand {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    /// Stringified `[module, function]` pair, as emitted by activity stubs.
    #[prost(string, tag = "2")]
    pub activity_type: String,
    #[prost(message, repeated, tag = "3")]
    pub arguments: Vec<Payload>,
    #[prost(uint64, tag = "4")]
    pub start_to_close_timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartTimerCommand {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompleteWorkflowExecution {
    #[prost(message, optional, tag = "1")]
    pub result: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FailWorkflowExecution {
    #[prost(message, optional, tag = "1")]
    pub failure: Option<Failure>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelWorkflowExecution {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RespondToQuery {
    #[prost(string, tag = "1")]
    pub query_id: String,
    #[prost(message, optional, tag = "2")]
    pub result: Option<Payload>,
    #[prost(message, optional, tag = "3")]
    pub failure: Option<Failure>,
}

/// One scheduled activity attempt, or a cancellation request for it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityTask {
    /// Opaque token, unique per scheduled attempt. Group identity.
    #[prost(bytes = "vec", tag = "1")]
    pub task_token: Vec<u8>,
    #[prost(string, tag = "2")]
    pub activity_id: String,
    #[prost(oneof = "activity_task::Variant", tags = "3, 4")]
    pub variant: Option<activity_task::Variant>,
}

pub mod activity_task {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "3")]
        Start(super::ActivityStart),
        #[prost(message, tag = "4")]
        Cancel(super::ActivityCancel),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityStart {
    #[prost(string, tag = "1")]
    pub workflow_namespace: String,
    #[prost(string, tag = "2")]
    pub workflow_type: String,
    #[prost(string, tag = "3")]
    pub workflow_run_id: String,
    #[prost(string, tag = "4")]
    pub workflow_id: String,
    /// Stringified `[module, function]` pair.
    #[prost(string, tag = "5")]
    pub activity_type: String,
    #[prost(map = "string, message", tag = "6")]
    pub header: HashMap<String, Payload>,
    #[prost(message, repeated, tag = "7")]
    pub input: Vec<Payload>,
    #[prost(message, repeated, tag = "8")]
    pub heartbeat_details: Vec<Payload>,
    #[prost(uint64, tag = "9")]
    pub scheduled_time_ms: u64,
    #[prost(uint32, tag = "10")]
    pub attempt: u32,
    #[prost(uint64, tag = "11")]
    pub schedule_to_close_timeout_ms: u64,
    #[prost(uint64, tag = "12")]
    pub start_to_close_timeout_ms: u64,
    #[prost(uint64, tag = "13")]
    pub heartbeat_timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityCancel {
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// Terminal outcome of an activity attempt.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityTaskCompletion {
    #[prost(bytes = "vec", tag = "1")]
    pub task_token: Vec<u8>,
    #[prost(oneof = "activity_task_completion::Status", tags = "2, 3, 4")]
    pub status: Option<activity_task_completion::Status>,
}

pub mod activity_task_completion {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Status {
        #[prost(message, tag = "2")]
        Completed(super::ActivityResultCompleted),
        #[prost(message, tag = "3")]
        Failed(super::ActivityResultFailed),
        #[prost(message, tag = "4")]
        Cancelled(super::ActivityResultCancelled),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityResultCompleted {
    #[prost(message, optional, tag = "1")]
    pub result: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityResultFailed {
    #[prost(message, optional, tag = "1")]
    pub failure: Option<Failure>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityResultCancelled {
    #[prost(message, repeated, tag = "1")]
    pub details: Vec<Payload>,
}

/// Progress report for a running activity, forwarded fire-and-forget.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivityHeartbeat {
    #[prost(bytes = "vec", tag = "1")]
    pub task_token: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub details: Vec<Payload>,
}
