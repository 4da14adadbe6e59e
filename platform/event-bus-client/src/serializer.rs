//! Wire encoding of envelopes
//!
//! The client never touches bytes directly; it hands envelopes to an injected
//! [`Serializer`] and passes the result to the connector.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{BusError, BusResult};

/// Pure encode/decode pair turning values into wire bytes and back
pub trait Serializer: Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> BusResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> BusResult<T>;

    /// Text form of [`Serializer::encode`], for transports that carry strings
    fn encode_to_string<T: Serialize + ?Sized>(&self, value: &T) -> BusResult<String> {
        let bytes = self.encode(value)?;
        String::from_utf8(bytes).map_err(|e| BusError::SerializationError(e.to_string()))
    }
}

/// JSON serializer backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> BusResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BusError::SerializationError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> BusResult<T> {
        serde_json::from_slice(bytes).map_err(|e| BusError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::messages::{LogMessage, LogSeverity};

    #[test]
    fn test_json_round_trip_preserves_envelope() {
        let serializer = JsonSerializer;
        let envelope = EventEnvelope::new(LogMessage::new(LogSeverity::Warning, "disk at 91%"));

        let bytes = serializer.encode(&envelope).unwrap();
        let decoded: EventEnvelope<LogMessage> = serializer.decode(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.route(), envelope.route());
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let result: BusResult<EventEnvelope<LogMessage>> = JsonSerializer.decode(b"not json");
        assert!(matches!(result, Err(BusError::SerializationError(_))));
    }

    #[test]
    fn test_encode_to_string() {
        let text = JsonSerializer
            .encode_to_string(&LogMessage::new(LogSeverity::Info, "ok"))
            .unwrap();
        assert_eq!(text, r#"{"severity":"info","message":"ok"}"#);
    }
}
