//! Huddle rendezvous relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! groups WebSocket connections into channels and fans frames out to every
//! member; peers use it only to find each other and negotiate direct
//! connections.

pub mod channels;
pub mod config;
pub mod rate_limit;
pub mod relay;
