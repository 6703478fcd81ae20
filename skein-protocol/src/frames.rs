//! Protocol frames.
//!
//! Every frame shares the header `{sender, id, in_response_to}`; the body
//! is a tagged sum type, so routing is a match on the variant instead of a
//! type-table lookup. `in_response_to = None` marks "not a response".
//!
//! Messages travel as one wire container per frame. Bulk data travels on
//! the data plane as a [`DataTransfer`] preamble container followed by raw
//! bytes, answered by a [`DataAck`] container.

use serde::{Deserialize, Serialize};

use skein_core::{
    DiscoveryInformation, EndpointId, MessageCodec, MessageId, ProtocolDescription,
    ProtocolInformation,
};

use crate::error::ProtocolResult;
use crate::wire;

/// Shared header carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Identity of the sending endpoint.
    pub sender: EndpointId,
    /// Unique id of this frame.
    pub id: MessageId,
    /// Id of the frame this one answers; `None` for non-responses.
    pub in_response_to: Option<MessageId>,
}

/// One protocol frame: header plus variant body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// The shared header.
    pub header: FrameHeader,
    /// The type-specific body.
    pub body: FrameBody,
}

impl Frame {
    /// Create a fresh frame (not a response).
    pub fn new(sender: EndpointId, body: FrameBody) -> Self {
        Self {
            header: FrameHeader {
                sender,
                id: MessageId::random(),
                in_response_to: None,
            },
            body,
        }
    }

    /// Create a response frame answering `in_response_to`.
    pub fn response_to(sender: EndpointId, in_response_to: MessageId, body: FrameBody) -> Self {
        Self {
            header: FrameHeader {
                sender,
                id: MessageId::random(),
                in_response_to: Some(in_response_to),
            },
            body,
        }
    }

    /// Whether this frame answers an earlier one.
    pub fn is_response(&self) -> bool {
        self.header.in_response_to.is_some()
    }

    /// Encode into a wire container with the given codec.
    ///
    /// # Errors
    ///
    /// Fails when serialization fails or the encoded frame exceeds the
    /// container size limit.
    pub fn encode<C: MessageCodec>(&self, codec: &C) -> ProtocolResult<Vec<u8>> {
        let payload = codec.encode(self)?;
        Ok(wire::encode_container(&payload)?)
    }

    /// Decode from a container payload with the given codec.
    ///
    /// # Errors
    ///
    /// Fails when the payload does not deserialize as a frame.
    pub fn decode<C: MessageCodec>(codec: &C, payload: &[u8]) -> ProtocolResult<Self> {
        Ok(codec.decode(payload)?)
    }
}

/// The type-specific bodies of all protocol frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    /// Initiate a handshake: here is who I am and what I offer.
    EndpointConnect {
        /// How the sender can be found during bootstrap.
        discovery: DiscoveryInformation,
        /// Connection points for every version the sender supports.
        candidates: Vec<ProtocolInformation>,
        /// The capabilities the sender offers.
        description: ProtocolDescription,
    },

    /// Answer a handshake: the local information plus the accept bit.
    EndpointConnectResponse {
        /// How the sender can be found during bootstrap.
        discovery: DiscoveryInformation,
        /// Connection points for every version the sender supports.
        candidates: Vec<ProtocolInformation>,
        /// The capabilities the sender offers.
        description: ProtocolDescription,
        /// Whether the sender accepts the connection.
        accepted: bool,
    },

    /// The sender is going away.
    EndpointDisconnect,

    /// Keep-alive probe, optionally carrying an application payload.
    ConnectionVerification {
        /// Application-supplied probe payload, echoed back in the reply.
        payload: Option<String>,
    },

    /// Keep-alive probe reply.
    ConnectionVerificationResponse {
        /// The echoed probe payload.
        payload: Option<String>,
    },

    /// "Please stream me this": ask the peer to push a registered upload.
    DataDownloadRequest {
        /// Token identifying the data on the serving peer.
        token: MessageId,
        /// Human-readable hint about what is being requested.
        target: String,
    },

    /// Generic positive acknowledgement.
    Success,

    /// Generic negative acknowledgement.
    Failure {
        /// Why the request was refused.
        reason: String,
    },

    /// The sender did not recognize the frame it was given.
    UnknownMessageType,

    /// Application traffic routed by subject; the payload is opaque to the
    /// protocol plane and belongs to the interaction layer above it.
    Application {
        /// Which capability this message belongs to.
        subject: String,
        /// The interaction layer's encoded message.
        payload: Vec<u8>,
    },
}

impl FrameBody {
    /// Whether this body belongs to the handshake exchange.
    ///
    /// Handshake frames bypass the approved-senders-only admission filter;
    /// nothing else from an unknown peer does, except the disconnect
    /// notification.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            FrameBody::EndpointConnect { .. } | FrameBody::EndpointConnectResponse { .. }
        )
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameBody::EndpointConnect { .. } => "endpoint_connect",
            FrameBody::EndpointConnectResponse { .. } => "endpoint_connect_response",
            FrameBody::EndpointDisconnect => "endpoint_disconnect",
            FrameBody::ConnectionVerification { .. } => "connection_verification",
            FrameBody::ConnectionVerificationResponse { .. } => {
                "connection_verification_response"
            }
            FrameBody::DataDownloadRequest { .. } => "data_download_request",
            FrameBody::Success => "success",
            FrameBody::Failure { .. } => "failure",
            FrameBody::UnknownMessageType => "unknown_message_type",
            FrameBody::Application { .. } => "application",
        }
    }
}

/// Preamble announcing a bulk stream on the data plane.
///
/// Sent as one container, followed by exactly `total_len` raw bytes. The
/// sender recorded here is authoritative for waiter lookup on the
/// receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransfer {
    /// Identity of the pushing endpoint.
    pub sender: EndpointId,
    /// Unique id of this transfer attempt.
    pub id: MessageId,
    /// Number of raw bytes that follow the preamble.
    pub total_len: u64,
}

/// Acknowledgement closing one bulk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAck {
    /// The transfer being acknowledged.
    pub id: MessageId,
    /// Number of raw bytes the receiver consumed and stored.
    pub received: u64,
}
