//! Encoding/decoding utilities for the worker protocol.
//!
//! Everything that crosses the bridge is a length-delimited protobuf
//! buffer; everything inside the worker is a decoded message. The helpers
//! here sit at that boundary.

use prost::Message;

use crate::errors::MessageError;
use crate::proto::{
    workflow_activation_completion, workflow_activation_job, Failure, Payload,
    WorkflowActivation, WorkflowActivationCompletion, WorkflowActivationFailure,
    WorkflowActivationJob,
};

/// Encode a protobuf message to bytes.
pub fn encode_message<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Decode a protobuf message from bytes.
pub fn decode_message<M>(bytes: &[u8]) -> Result<M, MessageError>
where
    M: Message + Default,
{
    M::decode(bytes).map_err(MessageError::from)
}

/// Encode a message with a length-delimiter prefix, as the bridge expects.
pub fn encode_framed<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_length_delimited_to_vec()
}

/// Decode a length-delimited message received from the bridge.
pub fn decode_framed<M>(bytes: &[u8]) -> Result<M, MessageError>
where
    M: Message + Default,
{
    M::decode_length_delimited(bytes).map_err(MessageError::from)
}

/// Add a length-delimiter prefix to an already-encoded message buffer.
pub fn frame_bytes(encoded: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(encoded.len() + 5);
    prost::encoding::encode_varint(encoded.len() as u64, &mut framed);
    framed.extend_from_slice(encoded);
    framed
}

/// Metadata key carrying the payload codec name.
pub const ENCODING_METADATA_KEY: &str = "encoding";
/// Codec name for plain JSON payloads.
pub const JSON_PLAIN_ENCODING: &[u8] = b"json/plain";

/// Build a JSON payload directly, bypassing the configured converter.
/// Used for values the worker itself synthesizes (commands, failures).
pub fn json_payload(value: &serde_json::Value) -> Result<Payload, MessageError> {
    let data = serde_json::to_vec(value)
        .map_err(|err| MessageError::Convert(format!("json encode: {err}")))?;
    let mut metadata = std::collections::HashMap::new();
    metadata.insert(
        ENCODING_METADATA_KEY.to_string(),
        JSON_PLAIN_ENCODING.to_vec(),
    );
    Ok(Payload { metadata, data })
}

/// Read a JSON payload back into a value.
pub fn json_from_payload(payload: &Payload) -> Result<serde_json::Value, MessageError> {
    serde_json::from_slice(&payload.data)
        .map_err(|err| MessageError::Convert(format!("json decode: {err}")))
}

/// Wire failure from any error, with the given type tag.
pub fn failure_from_error(error: &dyn std::error::Error, failure_type: &str) -> Failure {
    let cause = error
        .source()
        .map(|source| Box::new(failure_from_error(source, "")));
    Failure {
        message: error.to_string(),
        stack_trace: String::new(),
        failure_type: failure_type.to_string(),
        cause,
    }
}

/// Wire failure from a bare message.
pub fn failure_from_message(message: impl Into<String>, failure_type: &str) -> Failure {
    Failure {
        message: message.into(),
        stack_trace: String::new(),
        failure_type: failure_type.to_string(),
        cause: None,
    }
}

/// A completion that reports the whole activation as failed.
pub fn failed_activation_completion(
    run_id: impl Into<String>,
    failure: Failure,
) -> WorkflowActivationCompletion {
    WorkflowActivationCompletion {
        run_id: run_id.into(),
        status: Some(workflow_activation_completion::Status::Failed(
            WorkflowActivationFailure {
                failure: Some(failure),
            },
        )),
    }
}

/// A synthetic activation carrying only an eviction job for `run_id`.
/// Fed back into the workflow pipeline when the server rejects a
/// completion for that run, and during the graceful-drain sweep.
pub fn eviction_activation(
    run_id: impl Into<String>,
    reason: impl Into<String>,
) -> WorkflowActivation {
    WorkflowActivation {
        run_id: run_id.into(),
        timestamp_ms: 0,
        is_replaying: false,
        jobs: vec![WorkflowActivationJob {
            variant: Some(workflow_activation_job::Variant::RemoveFromCache(
                crate::proto::RemoveFromCache {
                    message: reason.into(),
                },
            )),
        }],
    }
}

/// Short label for an activation job, for logs and the handle job log.
pub fn job_label(job: &WorkflowActivationJob) -> &'static str {
    use workflow_activation_job::Variant;
    match &job.variant {
        Some(Variant::StartWorkflow(_)) => "start_workflow",
        Some(Variant::FireTimer(_)) => "fire_timer",
        Some(Variant::ResolveActivity(_)) => "resolve_activity",
        Some(Variant::SignalWorkflow(_)) => "signal_workflow",
        Some(Variant::QueryWorkflow(_)) => "query_workflow",
        Some(Variant::CancelWorkflow(_)) => "cancel_workflow",
        Some(Variant::UpdateRandomSeed(_)) => "update_random_seed",
        Some(Variant::NotifyHasChange(_)) => "notify_has_change",
        Some(Variant::RemoveFromCache(_)) => "remove_from_cache",
        None => "empty",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::workflow_activation_completion::Status;

    #[test]
    fn framed_roundtrip() {
        let completion = failed_activation_completion(
            "r1",
            failure_from_message("boom", "ApplicationFailure"),
        );
        let bytes = encode_framed(&completion);
        let decoded: WorkflowActivationCompletion = decode_framed(&bytes).expect("decode");
        assert_eq!(decoded.run_id, "r1");
        match decoded.status {
            Some(Status::Failed(failed)) => {
                assert_eq!(failed.failure.expect("failure").message, "boom");
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn eviction_activation_shape() {
        let activation = eviction_activation("r9", "completion rejected");
        assert_eq!(activation.run_id, "r9");
        assert_eq!(activation.jobs.len(), 1);
        assert_eq!(job_label(&activation.jobs[0]), "remove_from_cache");
    }

    #[test]
    fn json_payload_roundtrip() {
        let value = serde_json::json!({"a": 1, "b": [true, null, "x"]});
        let payload = json_payload(&value).expect("encode");
        assert_eq!(
            payload
                .metadata
                .get(ENCODING_METADATA_KEY)
                .map(Vec::as_slice),
            Some(JSON_PLAIN_ENCODING)
        );
        let back = json_from_payload(&payload).expect("decode");
        assert_eq!(value, back);
    }

    #[test]
    fn failure_from_error_keeps_message_and_type() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "inner");
        let failure = failure_from_error(&io, "ApplicationFailure");
        assert_eq!(failure.message, "inner");
        assert_eq!(failure.failure_type, "ApplicationFailure");
    }
}
