//! Error type shared by the Huddle wire codecs.
//!
//! Relay frames are JSON ([`crate::relay`]); chat messages on the data
//! channel use length-prefixed binary framing ([`crate::packed`]).

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Prepends a 4-byte little-endian length prefix to `payload`.
///
/// Wire format: `[u32 length (LE)][payload bytes]`
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the payload exceeds `u32::MAX` bytes.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CodecError::InvalidFrame(format!(
            "payload too large for framing: {} bytes",
            payload.len()
        ))
    })?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Strips the length prefix and returns the payload.
///
/// Unlike a stream decoder, the declared length must account for exactly
/// the rest of the buffer: a data-channel message carries one frame.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the input is shorter than the
/// prefix or the declared length differs from the bytes available.
pub fn unframe(bytes: &[u8]) -> Result<&[u8], CodecError> {
    let Some((prefix, rest)) = bytes.split_first_chunk::<4>() else {
        return Err(CodecError::InvalidFrame(format!(
            "need at least 4 bytes for length prefix, got {}",
            bytes.len()
        )));
    };
    let declared = u32::from_le_bytes(*prefix) as usize;
    if declared != rest.len() {
        return Err(CodecError::InvalidFrame(format!(
            "frame declares {declared} bytes but {} follow the prefix",
            rest.len()
        )));
    }
    Ok(rest)
}
