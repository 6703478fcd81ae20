//! # skein-protocol
//!
//! The protocol plane of the skein peer-to-peer runtime: endpoint
//! lifecycle, handshake negotiation, message routing with response
//! correlation, bulk data transfer, liveness monitoring and multi-version
//! channel multiplexing. Peers are symmetric: every process both offers
//! and consumes capabilities.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                ProtocolLayer                      │
//! │   send · send_and_wait · transfer_data · verify   │
//! ├──────────────┬──────────────┬────────────────────┤
//! │ Handshake    │ Endpoint     │ Connection         │
//! │ Conductor    │ Registry     │ Monitor            │
//! ├──────────────┴──────┬───────┴────────────────────┤
//! │   Message Handler   │   Data Handler             │
//! │   (correlation,     │   (stream waiters,         │
//! │    filters)         │    disk writes)            │
//! ├─────────────────────┴──────────────────────────┬─┤
//! │ ProtocolChannel: per-version hosts + senders   │ │
//! │ SendingEndpoint → RestoringChannel → template  │ │
//! └────────────────────────────────────────────────┴─┘
//! ```
//!
//! Incoming containers arrive at a receiver host and are handed to the
//! message or data handler, which either resolve an awaiting response or
//! match a filter. Outgoing calls resolve the peer through the registry
//! and use the sender pool for the peer's negotiated version. The
//! handshake conductor observes first contact from either side and drives
//! both endpoints to approval; the monitor probes approved peers and
//! evicts the unresponsive.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod channel;
pub mod completion;
pub mod config;
pub mod data_handler;
pub mod error;
pub mod frames;
pub mod handshake;
pub mod hosts;
pub mod layer;
pub mod message_handler;
pub mod monitor;
pub mod protocol_channel;
pub mod registry;
pub mod sending;
pub mod wire;

pub use channel::{DataSource, RestoringDataChannel, RestoringMessageChannel};
pub use completion::{Completer, WaitHandle, completion};
pub use config::ProtocolConfig;
pub use data_handler::{DataHandler, DataWaiter, FileInfo, UploadRegistry};
pub use error::{ProtocolError, ProtocolResult};
pub use frames::{DataAck, DataTransfer, Frame, FrameBody, FrameHeader};
pub use handshake::{ApprovalPolicy, HandshakeConductor, LocalEndpoint};
pub use hosts::{FrameSink, HostHandle, RestartPolicy};
pub use layer::{ProtocolLayer, ProtocolLayerBuilder};
pub use message_handler::{
    Dispatch, FrameAction, FrameFilter, IntegritySignal, MessageHandler, ResponseWaiter,
};
pub use monitor::{ConnectionMonitor, ConnectionVerifier};
pub use protocol_channel::ProtocolChannel;
pub use registry::{EndpointRegistry, EndpointSignal};
pub use sending::SendingEndpoint;
pub use wire::{CONTAINER_HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError};

// Re-export the core crate's types: users of the protocol plane need the
// identifiers, addresses and contracts without a second import.
pub use skein_core::{
    AddressParseError, ChannelListener, ChannelTemplate, CodecError, DiscoveryInformation,
    EndpointId, EndpointInformation, JsonCodec, MessageCodec, MessageId, NetworkAddress,
    ProtocolDescription, ProtocolInformation, ProtocolVersion, Subject, TcpChannelTemplate,
    highest_shared_version,
};
