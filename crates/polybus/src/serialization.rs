//! Payload Serialization
//!
//! The bus core stays generic over an opaque message object
//! (`serde_json::Value`) plus the declared type name. Concrete payload bytes
//! are produced and consumed through the [`MessageSerializer`] trait; typed
//! application APIs convert to and from concrete `serde` types at the edges.
//!
//! Each transport supplies a [`MessageProvider`] closure that materializes
//! the application message object for a resolved type from the raw transport
//! message. [`provider_from_serializer`] builds the default one from any
//! serializer.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{BusError, BusResult};
use crate::transport::InboundMessage;

/// Pure payload serializer; no I/O
pub trait MessageSerializer: Send + Sync {
    /// Serialize a message object of the named type into payload bytes
    fn serialize(&self, message_type: &str, message: &Value) -> BusResult<Bytes>;

    /// Deserialize payload bytes into a message object of the named type
    fn deserialize(&self, message_type: &str, payload: &[u8]) -> BusResult<Value>;
}

/// JSON payload serializer (the default)
///
/// The type name does not influence the JSON encoding; it is part of the
/// trait contract so that schema-aware serializers can dispatch on it.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, _message_type: &str, message: &Value) -> BusResult<Bytes> {
        let encoded = serde_json::to_vec(message)
            .map_err(|error| BusError::serialization(error.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    fn deserialize(&self, message_type: &str, payload: &[u8]) -> BusResult<Value> {
        serde_json::from_slice(payload).map_err(|error| {
            BusError::serialization(format!("cannot decode payload as '{message_type}': {error}"))
        })
    }
}

/// Closure materializing the application message object for a resolved type
/// from the raw transport message
pub type MessageProvider = Arc<dyn Fn(&str, &InboundMessage) -> BusResult<Value> + Send + Sync>;

/// Default message provider: deserialize the transport payload with the given
/// serializer
pub fn provider_from_serializer(serializer: Arc<dyn MessageSerializer>) -> MessageProvider {
    Arc::new(move |message_type, inbound| {
        serializer.deserialize(message_type, &inbound.payload)
    })
}
