//! Protocol version identification and negotiation.

use serde::{Deserialize, Serialize};

/// A discrete generation of wire-compatible frames.
///
/// Versions order lexicographically by `(major, minor)`, which is what the
/// handshake relies on to pick the highest version both peers support.
///
/// # Examples
///
/// ```
/// use skein_core::ProtocolVersion;
///
/// let v1 = ProtocolVersion::new(1, 0);
/// let v2 = ProtocolVersion::new(2, 0);
/// assert!(v1 < v2);
/// assert_eq!(v1.to_string(), "1.0");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion {
    /// Incremented on wire-incompatible changes.
    pub major: u16,
    /// Incremented on compatible additions.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Create a new version.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Pick the highest version present in both slices.
///
/// Returns `None` when the intersection is empty, in which case the two
/// peers cannot talk to each other and the handshake must abort.
pub fn highest_shared_version(
    ours: &[ProtocolVersion],
    theirs: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    ours.iter()
        .filter(|v| theirs.contains(v))
        .max()
        .copied()
}
