//! The protocol codec (§6.2): turns wire bytes into a structured value the
//! dispatcher can bind path/query captures onto, and back again.
//!
//! The real interface is a `ShapeSerializer`/`ShapeDeserializer` pair driven
//! as a visitor over a `Schema` and member index — the core treats it
//! opaquely and never constructs one itself. Modeling that visitor in full
//! needs the code generator this runtime explicitly treats as out of scope
//! (§1), so [`JsonCodec`] stands in as the one concrete, testable instance:
//! a rest-json-shaped codec backed by `serde_json::Value`, narrow enough to
//! exercise the dispatcher end-to-end without pretending to be a complete
//! protocol implementation.

use forge_error::{ErrorKind, RuntimeError};

/// Encodes and decodes operation bodies. Kept non-generic over `I`/`O` so it
/// stays object-safe — handlers convert between `serde_json::Value` and
/// their own typed shapes on either side of the codec.
pub trait Codec: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn encode(&self, value: &serde_json::Value) -> Result<bytes::Bytes, RuntimeError>;
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, RuntimeError>;
}

/// The runtime's default [`Codec`]: `application/json`, via `serde_json`. An
/// empty body decodes to `Value::Null` rather than failing, since
/// bodyless requests (most `GET`s) are common and have no payload to parse.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<bytes::Bytes, RuntimeError> {
        serde_json::to_vec(value)
            .map(bytes::Bytes::from)
            .map_err(|err| {
                RuntimeError::new(ErrorKind::CallValidation, "failed to encode response body")
                    .with_cause(err)
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, RuntimeError> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|err| {
            RuntimeError::new(ErrorKind::CallValidation, "failed to parse request body")
                .with_cause(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_decodes_to_null_rather_than_failing() {
        let codec = JsonCodec;
        assert_eq!(codec.decode(b"").unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn round_trips_a_json_object() {
        let codec = JsonCodec;
        let value = serde_json::json!({ "name": "widget", "count": 3 });
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn malformed_body_reports_a_validation_error() {
        let codec = JsonCodec;
        let err = codec.decode(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallValidation);
    }
}
