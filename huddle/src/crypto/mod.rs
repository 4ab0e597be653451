//! Message security for Huddle.
//!
//! Every chat message is encrypted with the group key (AES-256-GCM) and
//! signed with the sender's per-session Ed25519 key. The two checks are
//! independent: a message can decrypt fine and still carry a signature that
//! does not verify, and callers decide what to do with that.
//!
//! - [`keys`]: [`GroupKey`] and [`SenderKeyPair`].
//! - [`codec`]: [`pack`] and [`unpack`] over the packed-message layout.
//! - [`worker`]: a dedicated thread running the codec, with request-id
//!   correlated async calls.

pub mod codec;
pub mod keys;
pub mod worker;

pub use codec::{Unpacked, pack, unpack};
pub use keys::{GroupKey, SenderKeyPair};
pub use worker::CryptoClient;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The packed message is truncated or its length prefix is wrong.
    #[error("malformed packed message: {0}")]
    MalformedFrame(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// The authentication tag did not verify (wrong key or tampered data).
    #[error("decryption failed: ciphertext or key does not authenticate")]
    DecryptionFailed,

    /// Key material has the wrong size or format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The crypto worker thread is gone or answered out of protocol.
    #[error("crypto worker unavailable: {0}")]
    Worker(String),
}
