//! Identifiers for endpoints and messages.
//!
//! Both identifiers are opaque 128-bit values. [`EndpointId`] is generated
//! once per process start and is never reused across restarts, so two runs
//! of the same binary are distinct participants. [`MessageId`] is generated
//! per outgoing message and is the key for response correlation.

use serde::{Deserialize, Serialize};

/// Stable identity of one addressable process participant.
///
/// Generated randomly at process start; equality is by value. An id is
/// never reused across restarts, which lets the other side of a connection
/// distinguish "the same process" from "a new process on the same address".
///
/// # Examples
///
/// ```
/// use skein_core::EndpointId;
///
/// let a = EndpointId::random();
/// let b = EndpointId::random();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(u128);

impl EndpointId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Construct an id from an explicit value.
    ///
    /// Intended for tests and for tooling that needs reproducible ids; real
    /// endpoints use [`EndpointId::random`].
    pub const fn from_value(value: u128) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Unique token attached to every outgoing message.
///
/// A response carries the id of the message it answers in its
/// `in_response_to` header field (`None` marks "not a response"). Matching
/// is by exact value; out-of-order responses are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u128);

impl MessageId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Construct an id from an explicit value.
    pub const fn from_value(value: u128) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ids_are_distinct() {
        let a = EndpointId::random();
        let b = EndpointId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn endpoint_id_equality_by_value() {
        let a = EndpointId::from_value(42);
        let b = EndpointId::from_value(42);
        assert_eq!(a, b);
    }

    #[test]
    fn endpoint_id_display_is_hex() {
        let id = EndpointId::from_value(0xAB);
        assert_eq!(id.to_string(), format!("{:032x}", 0xABu32));
    }

    #[test]
    fn message_id_serde_roundtrip() {
        let id = MessageId::random();
        let json = serde_json::to_string(&id).expect("serialize");
        let decoded: MessageId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, decoded);
    }

    #[test]
    fn endpoint_id_serde_roundtrip() {
        let id = EndpointId::from_value(0x123456789ABCDEF0123456789ABCDEF0);
        let json = serde_json::to_string(&id).expect("serialize");
        let decoded: EndpointId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, decoded);
    }
}
