//! Peer identity types shared by discovery and negotiation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque unique identifier of a peer within a session.
///
/// Ordering is plain lexicographic string ordering; the negotiation layer
/// relies on it to pick the offerer of each pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this peer ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A peer's self-announced identity, broadcast over the relay.
///
/// Descriptors are re-sent whole on every heartbeat and never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    /// Identifier of the announcing peer.
    pub peer_id: PeerId,
    /// Human-readable name shown in rosters.
    pub display_name: String,
}

impl PeerDescriptor {
    /// Build a descriptor.
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
        }
    }
}
