//! Endpoint connection information and capability descriptions.
//!
//! These are the value types the handshake exchanges and the endpoint
//! registry stores. [`ProtocolInformation`] pins down where a peer listens
//! for one protocol version; [`EndpointInformation`] is the complete record
//! for a peer and is immutable once the peer is approved.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{EndpointId, NetworkAddress, ProtocolVersion};

/// Connection points for one protocol version of one endpoint.
///
/// Message framing and bulk streaming use distinct channels with different
/// delivery characteristics, hence two addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolInformation {
    /// The frame generation spoken on these addresses.
    pub version: ProtocolVersion,
    /// Where message containers are received.
    pub message_address: NetworkAddress,
    /// Where bulk data streams are received.
    pub data_address: NetworkAddress,
}

impl ProtocolInformation {
    /// Create connection information for one version.
    pub const fn new(
        version: ProtocolVersion,
        message_address: NetworkAddress,
        data_address: NetworkAddress,
    ) -> Self {
        Self {
            version,
            message_address,
            data_address,
        }
    }
}

/// Bootstrap-only information about how an endpoint was found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryInformation {
    /// The address the discovery layer answered from.
    pub discovery_address: NetworkAddress,
}

impl DiscoveryInformation {
    /// Create discovery information.
    pub const fn new(discovery_address: NetworkAddress) -> Self {
        Self { discovery_address }
    }
}

/// Everything the runtime knows about one endpoint.
///
/// `protocol` holds the single negotiated [`ProtocolInformation`]; during a
/// handshake the wire carries the full candidate list and the registry is
/// updated once the shared version is settled. After approval the record is
/// frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInformation {
    /// The peer's stable identity.
    pub id: EndpointId,
    /// How the peer was first found.
    pub discovery: DiscoveryInformation,
    /// The negotiated connection points.
    pub protocol: ProtocolInformation,
}

impl EndpointInformation {
    /// Create an endpoint record.
    pub const fn new(
        id: EndpointId,
        discovery: DiscoveryInformation,
        protocol: ProtocolInformation,
    ) -> Self {
        Self {
            id,
            discovery,
            protocol,
        }
    }
}

/// One abstract capability name offered by an endpoint.
///
/// Peers compare subject sets during the handshake to decide whether a
/// connection is mutually useful.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Subject(String);

impl Subject {
    /// Create a subject from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The subject name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of capabilities an endpoint offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescription {
    subjects: BTreeSet<Subject>,
}

impl ProtocolDescription {
    /// An empty description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a description from subject names.
    pub fn from_subjects<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subjects: subjects.into_iter().map(Subject::new).collect(),
        }
    }

    /// Add a subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.insert(Subject::new(subject));
        self
    }

    /// Iterate the offered subjects.
    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    /// Whether a subject is offered.
    pub fn offers(&self, subject: &Subject) -> bool {
        self.subjects.contains(subject)
    }

    /// Whether this description shares at least one subject with `other`.
    ///
    /// The default approval policy: a connection is mutually useful only if
    /// the subject intersection is non-empty.
    pub fn shares_subject_with(&self, other: &Self) -> bool {
        self.subjects.iter().any(|s| other.subjects.contains(s))
    }

    /// Whether no subjects are offered.
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}
