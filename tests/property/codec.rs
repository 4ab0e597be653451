//! Property-based tests for message security.
//!
//! Uses proptest to verify:
//! 1. A packed message decrypts under the group key and its signature
//!    verifies against the sender's key.
//! 2. Any altered byte of the IV or ciphertext fails authentication.
//! 3. An altered signature, or one made by another key, decrypts but
//!    reports an invalid signature.
//! 4. A different group key never decrypts.
//! 5. Arbitrary bytes never panic the unpacker.

use huddle::crypto::{CryptoError, GroupKey, SenderKeyPair, pack, unpack};
use huddle_proto::packed::{
    IV_LEN, LENGTH_PREFIX_LEN, PUBLIC_KEY_LEN, PackedMessage, SIGNATURE_LEN,
};
use proptest::prelude::*;

fn arb_plaintext() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn packed_message_opens_under_group_key(
        key in any::<[u8; 32]>(),
        secret in any::<[u8; 32]>(),
        plaintext in arb_plaintext(),
    ) {
        let group_key = GroupKey::from_bytes(key);
        let sender = SenderKeyPair::from_secret(&secret);
        let packed = pack(&group_key, &sender, &plaintext).unwrap();

        let unpacked = unpack(&group_key, &packed).unwrap();
        prop_assert_eq!(unpacked.plaintext, plaintext);
        prop_assert!(unpacked.signature_valid);
        prop_assert_eq!(unpacked.sender_public_key, sender.public_key());
    }

    #[test]
    fn altered_ciphertext_fails_authentication(
        plaintext in arb_plaintext(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let group_key = GroupKey::generate();
        let sender = SenderKeyPair::generate();
        let mut packed = pack(&group_key, &sender, &plaintext).unwrap();

        // IV plus ciphertext (tag included) sit between the prefix and the signature.
        let encrypted_len = packed.len() - LENGTH_PREFIX_LEN - SIGNATURE_LEN - PUBLIC_KEY_LEN;
        prop_assert!(encrypted_len >= IV_LEN + 16);
        packed[LENGTH_PREFIX_LEN + index.index(encrypted_len)] ^= flip;

        prop_assert_eq!(unpack(&group_key, &packed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn altered_signature_is_reported_not_fatal(
        plaintext in arb_plaintext(),
        index in 0..SIGNATURE_LEN,
        flip in 1u8..=255,
    ) {
        let group_key = GroupKey::generate();
        let sender = SenderKeyPair::generate();
        let mut packed = pack(&group_key, &sender, &plaintext).unwrap();

        let signature_start = packed.len() - SIGNATURE_LEN - PUBLIC_KEY_LEN;
        packed[signature_start + index] ^= flip;

        let unpacked = unpack(&group_key, &packed).unwrap();
        prop_assert_eq!(unpacked.plaintext, plaintext);
        prop_assert!(!unpacked.signature_valid);
    }

    #[test]
    fn signature_by_another_key_is_invalid(plaintext in arb_plaintext()) {
        let group_key = GroupKey::generate();
        let sender = SenderKeyPair::generate();
        let impostor = SenderKeyPair::generate();
        let packed = pack(&group_key, &sender, &plaintext).unwrap();

        let mut message = PackedMessage::from_bytes(&packed).unwrap();
        message.signature = impostor.sign(&message.signed_bytes());
        let resigned = message.to_bytes().unwrap();

        let unpacked = unpack(&group_key, &resigned).unwrap();
        prop_assert_eq!(unpacked.plaintext, plaintext);
        prop_assert_eq!(unpacked.sender_public_key, sender.public_key());
        prop_assert!(!unpacked.signature_valid);
    }

    #[test]
    fn other_group_key_never_decrypts(
        key in any::<[u8; 32]>(),
        other in any::<[u8; 32]>(),
        plaintext in arb_plaintext(),
    ) {
        prop_assume!(key != other);
        let sender = SenderKeyPair::generate();
        let packed = pack(&GroupKey::from_bytes(key), &sender, &plaintext).unwrap();

        prop_assert_eq!(
            unpack(&GroupKey::from_bytes(other), &packed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn random_bytes_never_panic_unpack(bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
        let _ = unpack(&GroupKey::generate(), &bytes);
    }
}
