//! Error taxonomy for the protocol plane.

use skein_core::{CodecError, EndpointId, NetworkAddress, ProtocolVersion};

use crate::wire::WireError;

/// Errors surfaced by the protocol plane.
///
/// Transport faults are caught at the restoring-channel and handler
/// boundaries; they surface here only after the retry budget is exhausted.
/// Handshake rejections are not errors at all, they are silent removals.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The transport refused or gave up after the configured attempts.
    /// Callers may retry at a higher level.
    #[error("send to {addr} failed after {attempts} attempt(s)")]
    SendFailed {
        /// The remote connection point.
        addr: NetworkAddress,
        /// How many attempts were made.
        attempts: u32,
    },

    /// No sender exists for the target endpoint; the caller must
    /// re-discover it.
    #[error("endpoint {endpoint} is not contactable")]
    EndpointNotContactable {
        /// The endpoint that could not be resolved.
        endpoint: EndpointId,
    },

    /// A registered waiter expired.
    #[error("timed out waiting for a response")]
    Timeout,

    /// A registered waiter was cancelled: the peer was lost, the local
    /// channel closed, or the caller cancelled explicitly.
    #[error("wait was cancelled")]
    Cancelled,

    /// No shared protocol version exists with the peer.
    #[error("no shared protocol version (peer offered {offered})")]
    VersionMismatch {
        /// The version the peer was discovered with.
        offered: ProtocolVersion,
    },

    /// An id, waiter or handler was registered twice.
    #[error("duplicate registration: {what}")]
    DuplicateRegistration {
        /// What was registered twice.
        what: String,
    },

    /// A receiver host faulted too many times in too short a window.
    /// Fatal for that host.
    #[error("receiver host faulted {restarts} times within the restart window")]
    MaxRestarts {
        /// Number of faults observed inside the window.
        restarts: u32,
    },

    /// Payload serialization failed.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    /// The wire container was malformed.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// An I/O operation failed outside the transport retry loop.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
