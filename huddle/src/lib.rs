//! Small-group peer-to-peer encrypted chat library.
//!
//! - [`discovery`]: rendezvous relay client (peer sets and signaling).
//! - [`mesh`]: one WebRTC connection per remote peer.
//! - [`crypto`]: group-key encryption and per-sender signatures.
//! - [`session`]: the driver tying the three together.
//! - [`config`]: layered client configuration.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod mesh;
pub mod session;
