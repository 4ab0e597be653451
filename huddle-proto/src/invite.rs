//! Invitation links and rendezvous keys.
//!
//! A link looks like `https://host/join#g=<group id>&k=<group key>&b=<relay>`.
//! Everything sensitive lives in the fragment, which browsers never send to
//! a server. The relay only ever sees [`discovery_key`], a hash of the group
//! id, so it cannot recover the group id or the key.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Random bytes in a group id.
pub const GROUP_ID_BYTES: usize = 16;
/// Group key size (AES-256).
pub const GROUP_KEY_BYTES: usize = 32;
/// Fragment parameter carrying the group id.
pub const PARAM_GROUP: &str = "g";
/// Fragment parameter carrying the group key.
pub const PARAM_KEY: &str = "k";
/// Fragment parameter carrying the bootstrap relay URL.
pub const PARAM_BOOTSTRAP: &str = "b";

/// Bytes escaped in fragment values, the same set `encodeURIComponent`
/// escapes. A space becomes `%20` and `+` stays distinct from it.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Errors from parsing an invitation link.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InviteError {
    /// The group id parameter is absent or empty.
    #[error("invitation is missing the group id")]
    MissingGroup,
    /// The key parameter is absent or empty.
    #[error("invitation is missing the group key")]
    MissingKey,
    /// The key is not valid base64url.
    #[error("invitation key is not valid base64url: {0}")]
    KeyEncoding(String),
    /// The decoded key has the wrong size.
    #[error("invitation key must be {GROUP_KEY_BYTES} bytes, got {0}")]
    KeyLength(usize),
}

/// A decoded invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    /// Base64url group identifier.
    pub group_id: String,
    /// Raw 256-bit group key.
    pub group_key: [u8; GROUP_KEY_BYTES],
    /// Relay to bootstrap from, if the link names one.
    pub bootstrap_url: Option<String>,
}

impl Invite {
    /// Generates a fresh group id and key.
    #[must_use]
    pub fn generate(bootstrap_url: Option<String>) -> Self {
        let mut id = [0u8; GROUP_ID_BYTES];
        OsRng.fill_bytes(&mut id);
        let mut group_key = [0u8; GROUP_KEY_BYTES];
        OsRng.fill_bytes(&mut group_key);
        Self {
            group_id: URL_SAFE_NO_PAD.encode(id),
            group_key,
            bootstrap_url: bootstrap_url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
        }
    }

    /// Renders the invitation as `{origin}/join#...`.
    #[must_use]
    pub fn to_link(&self, origin: &str) -> String {
        let key = URL_SAFE_NO_PAD.encode(self.group_key);
        let mut params = vec![(PARAM_GROUP, self.group_id.as_str()), (PARAM_KEY, key.as_str())];
        if let Some(bootstrap) = &self.bootstrap_url {
            params.push((PARAM_BOOTSTRAP, bootstrap.as_str()));
        }
        let fragment = params
            .iter()
            .map(|(name, value)| format!("{name}={}", utf8_percent_encode(value, COMPONENT)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}/join#{fragment}", origin.trim_end_matches('/'))
    }

    /// Parses a full link or a bare fragment (with or without `#`).
    ///
    /// # Errors
    ///
    /// Returns [`InviteError`] if the group id or key is missing, or the key
    /// does not decode to exactly [`GROUP_KEY_BYTES`] bytes.
    pub fn parse(link_or_fragment: &str) -> Result<Self, InviteError> {
        let fragment = link_or_fragment
            .split_once('#')
            .map_or(link_or_fragment, |(_, f)| f);

        let mut group_id = None;
        let mut key = None;
        let mut bootstrap_url = None;
        for pair in fragment.split('&') {
            let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode_str(raw).decode_utf8_lossy();
            if value.is_empty() {
                continue;
            }
            match name {
                PARAM_GROUP => group_id = Some(value.into_owned()),
                PARAM_KEY => key = Some(value.into_owned()),
                PARAM_BOOTSTRAP => bootstrap_url = Some(value.into_owned()),
                _ => {}
            }
        }

        let group_id = group_id.ok_or(InviteError::MissingGroup)?;
        let key = key.ok_or(InviteError::MissingKey)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(key.trim_end_matches('='))
            .map_err(|e| InviteError::KeyEncoding(e.to_string()))?;
        let group_key: [u8; GROUP_KEY_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| InviteError::KeyLength(bytes.len()))?;

        Ok(Self {
            group_id,
            group_key,
            bootstrap_url,
        })
    }

    /// Rendezvous channel key for this group.
    #[must_use]
    pub fn discovery_key(&self) -> String {
        discovery_key(&self.group_id)
    }
}

/// Channel key for a group: base64url (no padding) of SHA-256(group id).
#[must_use]
pub fn discovery_key(group_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(group_id.as_bytes()))
}
