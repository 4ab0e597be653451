//! Relay wire protocol types for the Huddle rendezvous relay.
//!
//! Defines the [`RelayFrame`] enum that is JSON-encoded and sent over
//! WebSocket text frames between discovery clients and the relay server.
//! After the join handshake the relay never inspects frames; it fans them
//! out verbatim to every member of the channel.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::peer::{PeerDescriptor, PeerId};
use crate::signaling::SignalingPayload;

/// WebSocket close codes sent by the relay, one per fatal cause.
pub mod close_code {
    /// The first frame was not a valid join request.
    pub const INVALID_JOIN: u16 = 4000;
    /// The per-IP connection rate was exceeded.
    pub const RATE_LIMIT_CONNECTION: u16 = 4001;
    /// The channel is at member capacity.
    pub const CHANNEL_FULL: u16 = 4002;
}

/// Machine-readable cause carried in an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed join request. Fatal.
    InvalidJoin,
    /// Too many connections from this address. Fatal.
    RateLimitConnection,
    /// Channel member cap reached. Fatal.
    ChannelFull,
    /// Too many frames in this channel from this address; frame dropped.
    RateLimitMessage,
    /// Frame exceeded the relay's size limit; frame dropped.
    FrameTooLarge,
}

impl ErrorCode {
    /// Close code that accompanies this error, or `None` when the relay
    /// keeps the connection open.
    #[must_use]
    pub const fn close_code(self) -> Option<u16> {
        match self {
            Self::InvalidJoin => Some(close_code::INVALID_JOIN),
            Self::RateLimitConnection => Some(close_code::RATE_LIMIT_CONNECTION),
            Self::ChannelFull => Some(close_code::CHANNEL_FULL),
            Self::RateLimitMessage | Self::FrameTooLarge => None,
        }
    }

    /// Whether the relay terminates the connection after this error.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        self.close_code().is_some()
    }

    /// Default human-readable message for this error.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::InvalidJoin => "Invalid join message.",
            Self::RateLimitConnection => "Too many connections, please try again later.",
            Self::ChannelFull => "Channel peer limit reached.",
            Self::RateLimitMessage => "Too many messages, please slow down.",
            Self::FrameTooLarge => "Frame exceeds the relay size limit.",
        }
    }
}

/// Frames exchanged between discovery clients and the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayFrame {
    /// Client asks to join a rendezvous channel.
    ///
    /// Must be the first frame sent after the WebSocket opens.
    Join {
        /// Channel key (hash of the group id).
        channel: String,
    },

    /// Relay acknowledges a successful join.
    Joined {
        /// The channel that was joined.
        channel: String,
    },

    /// A peer's self-descriptor, re-sent periodically as a heartbeat.
    Descriptor {
        /// The announcing peer's descriptor.
        descriptor: PeerDescriptor,
    },

    /// A negotiation payload addressed to one peer.
    ///
    /// Broadcast to the whole channel; receivers filter on `to`.
    Webrtc {
        /// Sender peer id.
        from: PeerId,
        /// Recipient peer id.
        to: PeerId,
        /// Offer, answer or ICE candidate.
        payload: SignalingPayload,
    },

    /// Relay reports an error condition.
    Error {
        /// Machine-readable cause.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl RelayFrame {
    /// Error frame for `code` with its default message.
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        Self::Error {
            code,
            message: code.default_message().to_string(),
        }
    }
}

/// Encodes a [`RelayFrame`] as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &RelayFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`RelayFrame`] from JSON bytes (text or binary frame payload).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a known frame.
pub fn decode(bytes: &[u8]) -> Result<RelayFrame, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Extracts the channel from a join request, or `None` if `bytes` is not a
/// well-formed join with a non-empty channel.
#[must_use]
pub fn parse_join(bytes: &[u8]) -> Option<String> {
    match decode(bytes) {
        Ok(RelayFrame::Join { channel }) if !channel.is_empty() => Some(channel),
        _ => None,
    }
}
