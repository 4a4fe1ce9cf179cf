//! Schema-registry wire framing.
//!
//! Every published record value is framed as:
//!
//! ```text
//! [0]          1-byte format marker (always 0)
//! [1..5]       schema id, big-endian u32
//! [5..]        raw JSON payload bytes
//! ```
//!
//! This framing must be reproduced byte-for-byte for interoperability with
//! schema-registry-aware consumers.

use thiserror::Error;

/// The fixed format marker at offset 0 of every framed message.
pub const FORMAT_MARKER: u8 = 0;

/// Bytes of framing preceding the payload.
pub const HEADER_LEN: usize = 5;

/// Errors produced when parsing a framed message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The message is shorter than the framing header.
    #[error("framed message too short: {0} bytes")]
    TooShort(usize),

    /// The format marker byte is not the expected value.
    #[error("unexpected format marker: {0}")]
    BadMarker(u8),
}

/// Frame a payload with the schema id header.
#[must_use]
pub fn encode(schema_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(FORMAT_MARKER);
    frame.extend_from_slice(&schema_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a framed message into its schema id and payload bytes.
///
/// # Errors
///
/// Returns [`FrameError`] if the message is shorter than the header or does
/// not start with the format marker. Consumers are expected to commit-and-skip
/// on this error rather than block their read offset.
pub fn decode(frame: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame[0] != FORMAT_MARKER {
        return Err(FrameError::BadMarker(frame[0]));
    }
    let schema_id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    Ok((schema_id, &frame[HEADER_LEN..]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let frame = encode(42, b"{}");
        assert_eq!(frame, vec![0, 0, 0, 0, 42, b'{', b'}']);
    }

    #[test]
    fn encode_big_endian_id() {
        let frame = encode(0x0102_0304, b"");
        assert_eq!(&frame[1..5], &[1, 2, 3, 4]);
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert_eq!(decode(&[0, 0, 0]), Err(FrameError::TooShort(3)));
    }

    #[test]
    fn decode_rejects_bad_marker() {
        assert_eq!(
            decode(&[7, 0, 0, 0, 1, b'x']),
            Err(FrameError::BadMarker(7))
        );
    }

    #[test]
    fn decode_recovers_id_and_payload() {
        let frame = encode(99, br#"{"k":1}"#);
        let (id, payload) = decode(&frame).unwrap();
        assert_eq!(id, 99);
        assert_eq!(payload, br#"{"k":1}"#);
    }
}
