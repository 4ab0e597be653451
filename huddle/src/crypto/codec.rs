//! Authenticated encryption of chat messages.
//!
//! `pack` draws a random 96-bit IV, encrypts with AES-256-GCM under the
//! group key, and signs `iv || ciphertext` with the sender key. `unpack`
//! parses the frame, checks the signature, and then decrypts.
//!
//! A bad signature is reported through [`Unpacked::signature_valid`] and
//! never fails the call. A bad authentication tag always does.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use huddle_proto::packed::{self, IV_LEN, PUBLIC_KEY_LEN, PackedMessage};
use rand::RngCore;
use rand::rngs::OsRng;

use super::CryptoError;
use super::keys::{self, GroupKey, SenderKeyPair};

/// Result of unpacking a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    /// Decrypted payload.
    pub plaintext: Vec<u8>,
    /// Public key embedded by the sender.
    pub sender_public_key: [u8; PUBLIC_KEY_LEN],
    /// Whether the signature verified against the embedded key.
    pub signature_valid: bool,
}

/// Encrypts and signs `plaintext`, returning the framed packed message.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] if AES-GCM rejects the input or
/// the frame cannot be built.
pub fn pack(
    group_key: &GroupKey,
    sender: &SenderKeyPair,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher(group_key)
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let signature = sender.sign(&packed::signed_bytes(&iv, &ciphertext));

    PackedMessage {
        iv,
        ciphertext,
        signature,
        public_key: sender.public_key(),
    }
    .to_bytes()
    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Parses, verifies and decrypts a packed message.
///
/// # Errors
///
/// - [`CryptoError::MalformedFrame`] if the frame is truncated or its
///   declared length is wrong. Nothing is decrypted in that case.
/// - [`CryptoError::DecryptionFailed`] if the authentication tag does not
///   verify under `group_key`.
pub fn unpack(group_key: &GroupKey, bytes: &[u8]) -> Result<Unpacked, CryptoError> {
    let message =
        PackedMessage::from_bytes(bytes).map_err(|e| CryptoError::MalformedFrame(e.to_string()))?;

    let signature_valid = verify(&message);

    let plaintext = cipher(group_key)
        .decrypt(Nonce::from_slice(&message.iv), message.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(Unpacked {
        plaintext,
        sender_public_key: message.public_key,
        signature_valid,
    })
}

/// Checks a parsed message's signature against its embedded public key.
#[must_use]
pub fn verify(message: &PackedMessage) -> bool {
    keys::verify(
        &message.public_key,
        &message.signed_bytes(),
        &message.signature,
    )
}

fn cipher(group_key: &GroupKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(group_key.as_bytes()))
}
