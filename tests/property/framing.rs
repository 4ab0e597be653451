//! Property-based tests for the wire formats.
//!
//! Uses proptest to verify:
//! 1. Arbitrary bytes never panic the packed-message parser.
//! 2. Any packed message survives serialize → parse.
//! 3. A frame whose declared length disagrees with its body is rejected.
//! 4. Arbitrary bytes never panic the relay frame decoder or join parser.

use huddle_proto::packed::{
    IV_LEN, LENGTH_PREFIX_LEN, MIN_FRAME_LEN, PUBLIC_KEY_LEN, PackedMessage, SIGNATURE_LEN,
};
use huddle_proto::relay;
use proptest::prelude::*;

fn arb_packed() -> impl Strategy<Value = PackedMessage> {
    (
        any::<[u8; IV_LEN]>(),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(any::<u8>(), SIGNATURE_LEN),
        any::<[u8; PUBLIC_KEY_LEN]>(),
    )
        .prop_map(|(iv, ciphertext, sig, public_key)| {
            let mut signature = [0u8; SIGNATURE_LEN];
            signature.copy_from_slice(&sig);
            PackedMessage {
                iv,
                ciphertext,
                signature,
                public_key,
            }
        })
}

proptest! {
    #[test]
    fn random_bytes_never_panic_packed_parser(bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
        let _ = PackedMessage::from_bytes(&bytes);
    }

    #[test]
    fn packed_message_round_trips(msg in arb_packed()) {
        let bytes = msg.to_bytes().unwrap();
        prop_assert!(bytes.len() >= MIN_FRAME_LEN);
        prop_assert_eq!(PackedMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn declared_length_must_match_body(msg in arb_packed(), delta in 1u32..64, grow in any::<bool>()) {
        let mut bytes = msg.to_bytes().unwrap();
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&bytes[..LENGTH_PREFIX_LEN]);
        let declared = u32::from_le_bytes(prefix);
        let wrong = if grow { declared + delta } else { declared.saturating_sub(delta) };
        bytes[..LENGTH_PREFIX_LEN].copy_from_slice(&wrong.to_le_bytes());
        prop_assert!(PackedMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn random_bytes_never_panic_relay_decoder(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = relay::decode(&bytes);
        let _ = relay::parse_join(&bytes);
    }

    #[test]
    fn any_non_empty_channel_is_a_valid_join(channel in "[A-Za-z0-9_-]{1,64}") {
        let json = relay::encode(&relay::RelayFrame::Join { channel: channel.clone() }).unwrap();
        prop_assert_eq!(relay::parse_join(json.as_bytes()), Some(channel));
    }
}
