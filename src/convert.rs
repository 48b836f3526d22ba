//! Payload codec.
//!
//! All payload operations are asynchronous so a converter backed by a
//! remote codec (encryption, compression services) fits the same trait as
//! the default in-process JSON converter.

use futures::future::BoxFuture;

use crate::errors::MessageError;
use crate::messages::{json_from_payload, json_payload};
use crate::proto::Payload;

/// Converts between user values and wire payloads.
pub trait DataConverter: Send + Sync {
    fn encode<'a>(
        &'a self,
        value: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<Payload, MessageError>>;

    fn decode<'a>(
        &'a self,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<serde_json::Value, MessageError>>;
}

/// Default converter: `json/plain` payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataConverter;

impl DataConverter for JsonDataConverter {
    fn encode<'a>(
        &'a self,
        value: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<Payload, MessageError>> {
        Box::pin(async move { json_payload(value) })
    }

    fn decode<'a>(
        &'a self,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<serde_json::Value, MessageError>> {
        Box::pin(async move { json_from_payload(payload) })
    }
}

/// Decode a batch of payloads in order.
pub async fn decode_all(
    converter: &dyn DataConverter,
    payloads: &[Payload],
) -> Result<Vec<serde_json::Value>, MessageError> {
    let mut values = Vec::with_capacity(payloads.len());
    for payload in payloads {
        values.push(converter.decode(payload).await?);
    }
    Ok(values)
}

/// Encode a batch of values in order.
pub async fn encode_all(
    converter: &dyn DataConverter,
    values: &[serde_json::Value],
) -> Result<Vec<Payload>, MessageError> {
    let mut payloads = Vec::with_capacity(values.len());
    for value in values {
        payloads.push(converter.encode(value).await?);
    }
    Ok(payloads)
}
