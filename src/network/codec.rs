//! Stream framing and binary encoding of netplay messages.
//!
//! Every message on the wire is a `u32` little-endian body length followed by the
//! bincode body. Bincode is configured once, in [`config`], with fixed-width
//! little-endian integers so a record has the same layout on every platform.
//!
//! Decoding distinguishes two failures:
//!
//! - [`DecodeError::Truncated`]: not enough bytes yet. Keep them buffered and
//!   retry once more data has arrived.
//! - [`DecodeError::Malformed`]: the bytes can never form a valid message. The
//!   connection that produced them must be closed.
//!
//! # Examples
//!
//! ```
//! use lockstep_netplay::network::codec::{decode, encode, DecodeError};
//! use lockstep_netplay::{Frame, Message};
//!
//! let bytes = encode(&Message::Sync { start_frame: Frame::new(50) }).expect("encodes");
//! let (message, used) = decode(&bytes).expect("decodes");
//! assert_eq!(message, Message::Sync { start_frame: Frame::new(50) });
//! assert_eq!(used, bytes.len());
//!
//! assert!(matches!(decode(&bytes[..3]), Err(DecodeError::Truncated { .. })));
//! ```

use std::fmt;

use crate::frame_record::{FrameRecord, FRAME_RECORD_WIRE_SIZE};
use crate::network::messages::{Handshake, Message};

/// Size of the length prefix in front of every message body.
pub const LEN_PREFIX: usize = 4;

/// Largest body length a peer may announce.
pub const MAX_MESSAGE_SIZE: usize = 4096;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Decoding config. The limit makes bincode reject length fields that claim more
/// bytes than a body can hold before it allocates for them.
fn decode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<MAX_MESSAGE_SIZE>()
}

/// Why bytes could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed. Not an error of the peer: buffer and retry.
    Truncated {
        /// Bytes required to make progress.
        needed: usize,
        /// Bytes currently available.
        available: usize,
    },
    /// The bytes are invalid. Terminal for the connection.
    Malformed {
        /// What was wrong with them.
        reason: String,
    },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Returns `true` for [`DecodeError::Truncated`].
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => write!(
                f,
                "truncated input: need {needed} bytes, {available} available"
            ),
            Self::Malformed { reason } => write!(f, "malformed message: {reason}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a message could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Bincode rejected the value.
    Serialize {
        /// The bincode error message.
        message: String,
    },
    /// The encoded body exceeds [`MAX_MESSAGE_SIZE`].
    TooLarge {
        /// Encoded body size.
        size: usize,
        /// The limit.
        max: usize,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize { message } => write!(f, "serialization failed: {message}"),
            Self::TooLarge { size, max } => {
                write!(f, "encoded message is {size} bytes, limit is {max}")
            },
        }
    }
}

impl std::error::Error for EncodeError {}

/// Encodes `message` with its length prefix into a new buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(LEN_PREFIX + FRAME_RECORD_WIRE_SIZE + 8);
    encode_append(message, &mut out)?;
    Ok(out)
}

/// Appends `message` with its length prefix to `out`, returning the bytes written.
///
/// On error `out` is left as it was.
pub fn encode_append(message: &Message, out: &mut Vec<u8>) -> Result<usize, EncodeError> {
    let start = out.len();
    out.extend_from_slice(&[0; LEN_PREFIX]);
    let body = match bincode::serde::encode_into_std_write(message, out, config()) {
        Ok(len) => len,
        Err(e) => {
            out.truncate(start);
            return Err(EncodeError::Serialize {
                message: e.to_string(),
            });
        },
    };
    if body > MAX_MESSAGE_SIZE {
        out.truncate(start);
        return Err(EncodeError::TooLarge {
            size: body,
            max: MAX_MESSAGE_SIZE,
        });
    }
    out[start..start + LEN_PREFIX].copy_from_slice(&(body as u32).to_le_bytes());
    Ok(LEN_PREFIX + body)
}

/// Decodes the first complete message in `bytes`.
///
/// Returns the message and the number of bytes it occupied, prefix included.
pub fn decode(bytes: &[u8]) -> Result<(Message, usize), DecodeError> {
    let Some(prefix) = bytes.first_chunk::<LEN_PREFIX>() else {
        return Err(DecodeError::Truncated {
            needed: LEN_PREFIX,
            available: bytes.len(),
        });
    };
    let len = u32::from_le_bytes(*prefix) as usize;
    if len == 0 {
        return Err(DecodeError::malformed("zero-length message"));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(DecodeError::malformed(format!(
            "announced length {len} exceeds {MAX_MESSAGE_SIZE}"
        )));
    }
    let total = LEN_PREFIX + len;
    let Some(body) = bytes.get(LEN_PREFIX..total) else {
        return Err(DecodeError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    };

    let (message, used): (Message, usize) = bincode::serde::decode_from_slice(body, decode_config())
        .map_err(|e| DecodeError::malformed(e.to_string()))?;
    if used != len {
        return Err(DecodeError::malformed(format!(
            "body used {used} of {len} announced bytes"
        )));
    }
    if let Message::Handshake(handshake) = &message {
        handshake.check_bounds().map_err(DecodeError::malformed)?;
    }
    Ok((message, total))
}

/// Encodes a bare record in its fixed-size layout, without a length prefix.
pub fn encode_record(record: &FrameRecord) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(record, config()).map_err(|e| EncodeError::Serialize {
        message: e.to_string(),
    })
}

/// Decodes a bare record written by [`encode_record`].
pub fn decode_record(bytes: &[u8]) -> Result<FrameRecord, DecodeError> {
    if bytes.len() < FRAME_RECORD_WIRE_SIZE {
        return Err(DecodeError::Truncated {
            needed: FRAME_RECORD_WIRE_SIZE,
            available: bytes.len(),
        });
    }
    let (record, _) = bincode::serde::decode_from_slice(&bytes[..FRAME_RECORD_WIRE_SIZE], decode_config())
        .map_err(|e| DecodeError::malformed(e.to_string()))?;
    Ok(record)
}

/// Encodes a handshake as a framed [`Message::Handshake`].
pub fn encode_handshake(handshake: &Handshake) -> Result<Vec<u8>, EncodeError> {
    encode(&Message::Handshake(handshake.clone()))
}

/// Decodes a framed handshake. Any other message is [`DecodeError::Malformed`].
pub fn decode_handshake(bytes: &[u8]) -> Result<(Handshake, usize), DecodeError> {
    match decode(bytes)? {
        (Message::Handshake(handshake), used) => Ok((handshake, used)),
        (other, _) => Err(DecodeError::malformed(format!(
            "expected Handshake, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{MAGIC, MAX_NICKNAME_LEN, PROTOCOL_VERSION};
    use crate::{Frame, MAX_DELAY_DEPTH};

    fn sample_record(frame: u64) -> FrameRecord {
        let mut record = FrameRecord::neutral(Frame::new(frame));
        record.set_button(3, true);
        record.set_analog_axis(1, -300);
        record.set_key(300, true);
        record
    }

    #[test]
    fn record_has_fixed_little_endian_layout() {
        let bytes = encode_record(&sample_record(0x0102)).unwrap();
        assert_eq!(bytes.len(), FRAME_RECORD_WIRE_SIZE);
        assert_eq!(&bytes[..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[0x08, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[18..20], &(-300i16).to_le_bytes());
    }

    #[test]
    fn record_roundtrip_and_truncation() {
        let record = sample_record(77);
        let bytes = encode_record(&record).unwrap();
        assert_eq!(decode_record(&bytes).unwrap(), record);
        assert_eq!(
            decode_record(&bytes[..10]),
            Err(DecodeError::Truncated {
                needed: FRAME_RECORD_WIRE_SIZE,
                available: 10
            })
        );
    }

    #[test]
    fn partial_body_is_truncated() {
        let bytes = encode(&Message::Input(sample_record(5))).unwrap();
        for cut in 0..bytes.len() {
            let err = decode(&bytes[..cut]).unwrap_err();
            assert!(err.is_truncated(), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn consecutive_messages_decode_in_order() {
        let mut stream = Vec::new();
        encode_append(&Message::Ping { nonce_ms: 9 }, &mut stream).unwrap();
        encode_append(&Message::Goodbye, &mut stream).unwrap();
        let (first, used) = decode(&stream).unwrap();
        assert_eq!(first, Message::Ping { nonce_ms: 9 });
        let (second, rest) = decode(&stream[used..]).unwrap();
        assert_eq!(second, Message::Goodbye);
        assert_eq!(used + rest, stream.len());
    }

    #[test]
    fn zero_and_oversized_lengths_are_malformed() {
        assert!(matches!(
            decode(&[0, 0, 0, 0]),
            Err(DecodeError::Malformed { .. })
        ));
        let huge = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        assert!(matches!(decode(&huge), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn unknown_variant_is_malformed() {
        let mut bytes = 4u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn trailing_body_bytes_are_malformed() {
        let mut bytes = encode(&Message::Goodbye).unwrap();
        let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) + 2;
        bytes[..4].copy_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn handshake_roundtrip() {
        let handshake = Handshake::new(3, true, "spectator");
        let bytes = encode_handshake(&handshake).unwrap();
        let (decoded, used) = decode_handshake(&bytes).unwrap();
        assert_eq!(decoded, handshake);
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn out_of_range_handshake_fields_are_malformed() {
        let long = Handshake::new(3, false, "n".repeat(MAX_NICKNAME_LEN + 1));
        let bytes = encode_handshake(&long).unwrap();
        assert!(matches!(
            decode_handshake(&bytes),
            Err(DecodeError::Malformed { .. })
        ));

        let deep = Handshake::new(MAX_DELAY_DEPTH + 1, false, "n");
        let bytes = encode_handshake(&deep).unwrap();
        assert!(matches!(
            decode_handshake(&bytes),
            Err(DecodeError::Malformed { .. })
        ));
    }

    /// A handshake frame whose nickname claims `nickname_len` bytes.
    fn handshake_claiming(nickname_len: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&MAGIC.to_le_bytes());
        body.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        body.extend_from_slice(&2u32.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&nickname_len.to_le_bytes());
        let mut bytes = (body.len() as u32).to_le_bytes().to_vec();
        bytes.extend(body);
        bytes
    }

    #[test]
    fn oversized_length_claims_are_malformed() {
        for claim in [1 << 46, u64::MAX, MAX_MESSAGE_SIZE as u64 + 1] {
            let bytes = handshake_claiming(claim);
            assert_eq!(bytes.len(), 29);
            assert!(
                matches!(decode(&bytes), Err(DecodeError::Malformed { .. })),
                "claim {claim}"
            );
        }
        // a claim that fits the limit but not the body is still malformed
        assert!(matches!(
            decode(&handshake_claiming(8)),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn decode_handshake_rejects_other_messages() {
        let bytes = encode(&Message::Goodbye).unwrap();
        assert!(matches!(
            decode_handshake(&bytes),
            Err(DecodeError::Malformed { .. })
        ));
    }
}
