use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::{DecodeError, EncodeError};
use crate::{Frame, Port};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        kind: InvalidRequestKind,
    },
    /// The session has not finished its handshake with the peer yet. Skip this tick and call
    /// `pre_frame` again on the next one.
    NotSynchronized,
    /// The peer sent a handshake with a wrong magic number or sent data before the handshake.
    HandshakeFailed {
        /// Human-readable description of what went wrong.
        reason: String,
    },
    /// The peer speaks a different protocol version, or its delay depth cannot be adopted.
    ProtocolMismatch {
        /// The protocol version (or delay depth) we expected.
        local: u32,
        /// The value the remote side announced.
        remote: u32,
    },
    /// A frame record was pushed out of sequence. The two simulations can no longer be assumed identical.
    FrameOutOfOrder {
        /// The port the record was pushed for.
        port: Port,
        /// The frame the buffer expected next.
        expected: Frame,
        /// The frame that was actually pushed.
        got: Frame,
    },
    /// The peers disagree about the frame history (for example the frame at which users are flipped).
    Desync {
        /// The frame at which the disagreement was detected.
        frame: Frame,
        /// Description of the disagreement.
        reason: String,
    },
    /// The remote input for the current tick did not arrive within the stall timeout.
    ConnectionStalled {
        /// The tick that is waiting for remote input.
        frame: Frame,
        /// How long `pre_frame` waited before giving up.
        waited_ms: u128,
    },
    /// The session is closed. No further `pre_frame`/`post_frame` calls are valid.
    SessionClosed,
    /// Bytes received from a peer could not be decoded.
    Decode(DecodeError),
    /// A message could not be encoded.
    Encode(EncodeError),
    /// A network socket operation failed.
    Socket {
        /// A description of the socket error.
        context: String,
    },
}

/// Reasons for a [`NetplayError::InvalidRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidRequestKind {
    /// The requested delay depth exceeds the supported maximum.
    DelayDepthTooLarge {
        /// The requested depth.
        depth: u32,
        /// The largest supported depth.
        max: u32,
    },
    /// The nickname is longer than the wire format allows.
    NicknameTooLong {
        /// Length of the nickname in bytes.
        len: usize,
        /// Maximum accepted length in bytes.
        max: usize,
    },
    /// A port outside of the netplay port range was given.
    InvalidPort {
        /// The offending port.
        port: Port,
    },
    /// Users can only be flipped in a running host/client session.
    FlipNotAllowed {
        /// Why the flip was rejected.
        reason: &'static str,
    },
    /// A configuration value is out of range.
    InvalidConfig {
        /// Which field was rejected.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// `pre_frame` and `post_frame` must be called alternately.
    CallOrder {
        /// The call that was made out of order.
        call: &'static str,
    },
}

impl Display for InvalidRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DelayDepthTooLarge { depth, max } => {
                write!(f, "delay depth {} exceeds the maximum of {}", depth, max)
            },
            Self::NicknameTooLong { len, max } => {
                write!(f, "nickname is {} bytes long, maximum is {}", len, max)
            },
            Self::InvalidPort { port } => write!(f, "port {} is not a netplay port", port),
            Self::FlipNotAllowed { reason } => write!(f, "cannot flip users: {}", reason),
            Self::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration for {}: {}", field, reason)
            },
            Self::CallOrder { call } => write!(f, "{} called out of order", call),
        }
    }
}

/// Result alias used throughout the crate.
pub type NetplayResult<T> = Result<T, NetplayError>;

impl From<InvalidRequestKind> for NetplayError {
    fn from(kind: InvalidRequestKind) -> Self {
        Self::InvalidRequest { kind }
    }
}

impl From<DecodeError> for NetplayError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<EncodeError> for NetplayError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}

impl NetplayError {
    /// Returns `true` for errors after which the session can not continue.
    ///
    /// [`NotSynchronized`](Self::NotSynchronized) and
    /// [`ConnectionStalled`](Self::ConnectionStalled) are transient: retry on the next tick.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FrameOutOfOrder { .. } | Self::Desync { .. } | Self::SessionClosed
        )
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidRequest { kind } => {
                write!(f, "Invalid Request: {}", kind)
            },
            NetplayError::NotSynchronized => {
                write!(f, "The session is not yet synchronized with the remote peer.")
            },
            NetplayError::HandshakeFailed { reason } => {
                write!(f, "Handshake failed: {}", reason)
            },
            NetplayError::ProtocolMismatch { local, remote } => {
                write!(
                    f,
                    "Protocol mismatch: local value {}, remote value {}",
                    local, remote
                )
            },
            NetplayError::FrameOutOfOrder {
                port,
                expected,
                got,
            } => {
                write!(
                    f,
                    "Frame out of order on port {}: expected frame {}, got {}",
                    port, expected, got
                )
            },
            NetplayError::Desync { frame, reason } => {
                write!(f, "Desync detected at frame {}: {}", frame, reason)
            },
            NetplayError::ConnectionStalled { frame, waited_ms } => {
                write!(
                    f,
                    "Connection stalled: no remote input for frame {} after {} ms",
                    frame, waited_ms
                )
            },
            NetplayError::SessionClosed => write!(f, "The netplay session is closed."),
            NetplayError::Decode(err) => write!(f, "Decode error: {}", err),
            NetplayError::Encode(err) => write!(f, "Encode error: {}", err),
            NetplayError::Socket { context } => write!(f, "Socket error: {}", context),
        }
    }
}

impl Error for NetplayError {}

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
    fn out_of_order_message_names_both_frames() {
        let err = NetplayError::FrameOutOfOrder {
            port: Port::new(1),
            expected: Frame::new(4),
            got: Frame::new(6),
        };
        let text = err.to_string();
        assert!(text.contains("port 1"));
        assert!(text.contains("expected frame 4"));
        assert!(text.contains("got 6"));
    }

    #[test]
    fn invalid_request_wraps_kind() {
        let err: NetplayError = InvalidRequestKind::DelayDepthTooLarge { depth: 99, max: 16 }.into();
        assert_eq!(
            err.to_string(),
            "Invalid Request: delay depth 99 exceeds the maximum of 16"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(NetplayError::SessionClosed.is_fatal());
        assert!(NetplayError::Desync {
            frame: Frame::new(3),
            reason: "x".to_owned()
        }
        .is_fatal());
        assert!(!NetplayError::NotSynchronized.is_fatal());
        assert!(!NetplayError::ConnectionStalled {
            frame: Frame::new(1),
            waited_ms: 10
        }
        .is_fatal());
    }

    #[test]
    fn decode_error_converts() {
        let err: NetplayError = DecodeError::Truncated { needed: 8, available: 2 }.into();
        assert!(matches!(err, NetplayError::Decode(DecodeError::Truncated { .. })));
    }
}
