//! Frame codec for the AppLink protocol.
//!
//! Wire format:
//! ```text
//! [payload_len: u32 BE][payload: payload_len bytes of JSON]
//! ```
//! The length prefix lets the server read exactly one frame before parsing,
//! and bound the read with [`MAX_FRAME_LEN`] so a misbehaving client cannot
//! make it buffer unbounded data.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Upper bound on a single frame's payload. A handshake is a few hundred
/// bytes; 64 KiB leaves generous room for query metadata.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame it declares.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The declared payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame too large: {declared} bytes exceeds the {max} byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    /// The payload is not valid JSON for the expected message type.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Encodes a message into a length-prefixed frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the serialized payload would
/// exceed [`MAX_FRAME_LEN`], and [`ProtocolError::Malformed`] if the message
/// cannot be serialized.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            declared: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one message from the beginning of `bytes`.
///
/// Returns the message and the total number of bytes consumed (prefix plus
/// payload), so a caller reading from a buffered stream can advance its
/// cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the frame is truncated, oversized, or not
/// valid JSON for `T`.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), ProtocolError> {
    let payload_len = frame_payload_len(bytes)?;

    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let msg = serde_json::from_slice(&bytes[HEADER_SIZE..total])
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok((msg, total))
}

/// Reads and validates the length prefix of a frame.
///
/// Useful for stream readers that fetch the header first and then read
/// exactly the payload.
pub fn frame_payload_len(bytes: &[u8]) -> Result<usize, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            declared,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(declared)
}
