//! Key material for Huddle.
//!
//! The group key is shared out of band through the invitation link and
//! never crosses the relay or a data channel. Sender keys are generated per
//! session and only their public half travels, embedded in each message.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use huddle_proto::invite::GROUP_KEY_BYTES;
use huddle_proto::packed::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// 256-bit symmetric group key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey([u8; GROUP_KEY_BYTES]);

impl GroupKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; GROUP_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; GROUP_KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// Wrap a key given as a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] unless `bytes` is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; GROUP_KEY_BYTES] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "group key must be {GROUP_KEY_BYTES} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Raw key bytes. Only the codec should need these.
    #[must_use]
    pub(crate) const fn as_bytes(&self) -> &[u8; GROUP_KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupKey(..)")
    }
}

/// A per-session Ed25519 signing key pair.
///
/// The secret half is zeroized on drop by `ed25519-dalek`.
pub struct SenderKeyPair {
    signing: SigningKey,
}

impl SenderKeyPair {
    /// Generate a new key pair from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a key pair from its 32-byte secret.
    #[must_use]
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Public key bytes, embedded in every packed message.
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// Short hex fingerprint of the public key, for display.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }
}

impl fmt::Debug for SenderKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyPair")
            .field("public", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Checks `signature` over `message` against a raw public key.
///
/// Never errors: a public key that is not a valid curve point simply fails
/// verification.
#[must_use]
pub fn verify(
    public_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}

/// Hex string of the first 8 bytes of a public key.
#[must_use]
pub fn fingerprint(public_key: &[u8]) -> String {
    use std::fmt::Write;
    let bytes = &public_key[..8.min(public_key.len())];
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02x}");
        output
    })
}
