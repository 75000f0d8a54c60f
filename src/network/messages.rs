use serde::{Deserialize, Serialize};

use crate::frame_record::FrameRecord;
use crate::{Frame, MAX_DELAY_DEPTH, NUM_PORTS};

/// Leading word of every handshake ("NETP").
pub const MAGIC: u32 = 0x4E45_5450;

/// Version of the message set below. Peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Longest nickname, in bytes, a handshake may carry.
pub const MAX_NICKNAME_LEN: usize = 32;

/// The first message each side sends on a new stream.
///
/// The initiating side sends its handshake as soon as the stream is open; the
/// accepting side answers with its own. No other message may precede it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handshake {
    /// Must equal [`MAGIC`].
    pub magic: u32,
    /// Must equal the receiver's [`PROTOCOL_VERSION`].
    pub protocol_version: u32,
    /// Requested (client) or authoritative (host) delay depth.
    pub delay_depth: u32,
    /// Whether the sender is or serves spectators only.
    pub spectate: bool,
    /// Display name, at most [`MAX_NICKNAME_LEN`] bytes.
    pub nickname: String,
}

impl Handshake {
    /// A handshake for this build's protocol.
    #[must_use]
    pub fn new(delay_depth: u32, spectate: bool, nickname: impl Into<String>) -> Self {
        Self {
            magic: MAGIC,
            protocol_version: PROTOCOL_VERSION,
            delay_depth,
            spectate,
            nickname: nickname.into(),
        }
    }

    /// Checks the fields that are range-limited by the wire format.
    pub(crate) fn check_bounds(&self) -> Result<(), &'static str> {
        if self.nickname.len() > MAX_NICKNAME_LEN {
            return Err("nickname longer than 32 bytes");
        }
        if self.delay_depth > MAX_DELAY_DEPTH {
            return Err("delay depth out of range");
        }
        Ok(())
    }
}

/// Everything that travels over a netplay stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Opening message, see [`Handshake`].
    Handshake(Handshake),
    /// Host to peer: the first frame the peer simulates.
    Sync {
        /// Start frame (0 for the primary peer, the join frame for spectators).
        start_frame: Frame,
    },
    /// Peer to host: acknowledges [`Message::Sync`].
    SyncAck {
        /// Echo of the start frame.
        start_frame: Frame,
    },
    /// One locally captured record. The receiver maps it to a port from its frame.
    Input(FrameRecord),
    /// Host to spectators: the records applied to every port on `frame`.
    Combined {
        /// The simulated frame.
        frame: Frame,
        /// Applied record per port.
        ports: [FrameRecord; NUM_PORTS],
    },
    /// Swap the port assignment for every record captured at or after `effective_frame`.
    Flip {
        /// First frame captured with the swapped assignment.
        effective_frame: Frame,
    },
    /// Acknowledges a [`Message::Flip`] for the same frame.
    FlipAck {
        /// Echo of the flip's effective frame.
        effective_frame: Frame,
    },
    /// Round-trip measurement.
    Ping {
        /// Sender's clock in milliseconds, echoed back in the pong.
        nonce_ms: u64,
    },
    /// Reply to [`Message::Ping`].
    Pong {
        /// The ping's nonce.
        nonce_ms: u64,
    },
    /// The sender is closing the stream.
    Goodbye,
}

impl Message {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::Sync { .. } => "Sync",
            Self::SyncAck { .. } => "SyncAck",
            Self::Input(_) => "Input",
            Self::Combined { .. } => "Combined",
            Self::Flip { .. } => "Flip",
            Self::FlipAck { .. } => "FlipAck",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Goodbye => "Goodbye",
        }
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

    #[test]
    fn new_handshake_uses_current_protocol() {
        let hs = Handshake::new(3, false, "alice");
        assert_eq!(hs.magic, MAGIC);
        assert_eq!(hs.protocol_version, PROTOCOL_VERSION);
        assert!(hs.check_bounds().is_ok());
    }

    #[test]
    fn handshake_bounds() {
        let long = Handshake::new(3, false, "x".repeat(MAX_NICKNAME_LEN + 1));
        assert!(long.check_bounds().is_err());
        let exact = Handshake::new(3, false, "x".repeat(MAX_NICKNAME_LEN));
        assert!(exact.check_bounds().is_ok());
        let deep = Handshake::new(MAX_DELAY_DEPTH + 1, false, "x");
        assert!(deep.check_bounds().is_err());
    }

    #[test]
    fn kind_names() {
        assert_eq!(Message::Goodbye.kind(), "Goodbye");
        assert_eq!(
            Message::Flip {
                effective_frame: Frame::new(6)
            }
            .kind(),
            "Flip"
        );
    }
}
