//! Shared protocol definitions for the Huddle wire formats.
//!
//! - [`relay`]: JSON frames exchanged with the rendezvous relay.
//! - [`signaling`]: offer/answer/ICE payloads carried inside relay frames.
//! - [`packed`]: binary framing of encrypted chat messages on the data channel.
//! - [`invite`]: invitation links and discovery keys.
//! - [`message`]: message ids and timestamps.

pub mod codec;
pub mod invite;
pub mod message;
pub mod packed;
pub mod peer;
pub mod relay;
pub mod signaling;
