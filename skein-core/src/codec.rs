//! Pluggable frame payload serialization.
//!
//! The [`MessageCodec`] trait lets deployments bring their own format
//! (JSON, bincode, messagepack, ...) while [`JsonCodec`] is the provided
//! default. Frame bodies only require serde derives, so switching formats
//! is a type-parameter change.
//!
//! # Example
//!
//! ```
//! use skein_core::{MessageCodec, JsonCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Probe { seq: u32 }
//!
//! let codec = JsonCodec;
//! let probe = Probe { seq: 1 };
//!
//! let bytes = codec.encode(&probe).unwrap();
//! let decoded: Probe = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded, probe);
//! ```

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable serialization format for frame payloads.
///
/// Implementations must be cheap to clone; a codec instance is stored in
/// every sender pool and receiver host.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable on the wire, which makes protocol traces easy to follow;
/// not the most compact option for production traffic.
#[derive(Clone, Copy, Default, Debug)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct TestMessage {
        id: u32,
        content: String,
    }

    #[test]
    fn json_codec_roundtrip() {
        let codec = JsonCodec;
        let msg = TestMessage {
            id: 42,
            content: "hello world".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: TestMessage = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn json_codec_decode_error() {
        let codec = JsonCodec;
        let result: Result<TestMessage, CodecError> = codec.decode(b"not valid json {");
        let err = result.err().expect("decode should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn json_codec_type_mismatch() {
        let codec = JsonCodec;
        let bytes = codec
            .encode(&TestMessage {
                id: 1,
                content: "x".to_string(),
            })
            .expect("encode should succeed");
        let result: Result<u64, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn json_codec_option_roundtrip() {
        let codec = JsonCodec;
        let some_val: Option<i32> = Some(42);
        let bytes = codec.encode(&some_val).expect("encode");
        let decoded: Option<i32> = codec.decode(&bytes).expect("decode");
        assert_eq!(some_val, decoded);

        let none_val: Option<i32> = None;
        let bytes = codec.encode(&none_val).expect("encode");
        let decoded: Option<i32> = codec.decode(&bytes).expect("decode");
        assert_eq!(none_val, decoded);
    }
}
