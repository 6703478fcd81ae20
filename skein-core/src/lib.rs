//! # skein-core
//!
//! Foundational types and external contracts for the skein peer-to-peer
//! communication runtime.
//!
//! Everything in this crate is either a plain value type shared by both
//! sides of the wire (identifiers, versions, addresses, endpoint
//! descriptions) or a contract the protocol plane depends on but does not
//! own:
//!
//! - [`ChannelTemplate`]: the transport substrate that carries encoded
//!   containers between processes. The protocol plane never touches sockets
//!   directly; it asks a template for streams and listeners.
//! - [`MessageCodec`]: the serialization format for frame payloads. A
//!   [`JsonCodec`] is provided as the default.
//!
//! ## Core Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`EndpointId`] | Stable per-process participant identity |
//! | [`MessageId`] | Unique token per outgoing message |
//! | [`ProtocolVersion`] | Wire-compatible frame generation |
//! | [`NetworkAddress`] | ip + port of a connection point |
//! | [`ProtocolInformation`] | Version-tagged message/data addresses |
//! | [`EndpointInformation`] | Everything known about a peer |
//! | [`ProtocolDescription`] | The capability subjects a peer offers |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod codec;
mod identity;
mod info;
mod template;
mod version;

pub use address::{AddressParseError, NetworkAddress};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use identity::{EndpointId, MessageId};
pub use info::{
    DiscoveryInformation, EndpointInformation, ProtocolDescription, ProtocolInformation, Subject,
};
pub use template::{ChannelListener, ChannelTemplate, TcpChannelTemplate, TcpListener};
pub use version::{ProtocolVersion, highest_shared_version};
