//! Binary layout of an encrypted, signed chat message.
//!
//! ```text
//! [u32 total (LE)][iv: 12][ciphertext: variable][signature: 64][public key: 32]
//! ```
//!
//! `total` covers everything after the prefix. The cryptography itself
//! lives in the client crate; this module only owns the layout.

use crate::codec::{self, CodecError};

/// AES-GCM nonce length.
pub const IV_LEN: usize = 12;
/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;
/// Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length prefix size.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Smallest well-formed frame: prefix, IV, empty ciphertext, signature, key.
pub const MIN_FRAME_LEN: usize = LENGTH_PREFIX_LEN + IV_LEN + SIGNATURE_LEN + PUBLIC_KEY_LEN;

/// A parsed packed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedMessage {
    /// Per-message random nonce.
    pub iv: [u8; IV_LEN],
    /// AES-GCM output, authentication tag included.
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over `iv || ciphertext`.
    pub signature: [u8; SIGNATURE_LEN],
    /// Sender's Ed25519 public key, for attribution.
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl PackedMessage {
    /// The bytes covered by the signature: `iv || ciphertext`.
    #[must_use]
    pub fn signed_bytes(&self) -> Vec<u8> {
        signed_bytes(&self.iv, &self.ciphertext)
    }

    /// Serializes the message with its length prefix.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidFrame` if the total exceeds `u32::MAX`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut body =
            Vec::with_capacity(IV_LEN + self.ciphertext.len() + SIGNATURE_LEN + PUBLIC_KEY_LEN);
        body.extend_from_slice(&self.iv);
        body.extend_from_slice(&self.ciphertext);
        body.extend_from_slice(&self.signature);
        body.extend_from_slice(&self.public_key);
        codec::frame(&body)
    }

    /// Parses a framed message.
    ///
    /// Buffers shorter than [`MIN_FRAME_LEN`] are rejected before the
    /// prefix is even read.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidFrame` if the buffer is truncated or the
    /// declared length does not match the bytes that follow it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(CodecError::InvalidFrame(format!(
                "packed message needs at least {MIN_FRAME_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let body = codec::unframe(bytes)?;

        let (iv, rest) = body
            .split_first_chunk::<IV_LEN>()
            .ok_or_else(|| CodecError::InvalidFrame("missing iv".into()))?;
        let (rest, public_key) = rest
            .split_last_chunk::<PUBLIC_KEY_LEN>()
            .ok_or_else(|| CodecError::InvalidFrame("missing public key".into()))?;
        let (ciphertext, signature) = rest
            .split_last_chunk::<SIGNATURE_LEN>()
            .ok_or_else(|| CodecError::InvalidFrame("missing signature".into()))?;

        Ok(Self {
            iv: *iv,
            ciphertext: ciphertext.to_vec(),
            signature: *signature,
            public_key: *public_key,
        })
    }
}

/// Concatenates `iv || ciphertext` for signing and verification.
#[must_use]
pub fn signed_bytes(iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    out
}
