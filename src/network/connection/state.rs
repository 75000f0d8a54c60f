//! Connection state machine.
//!
//! ```text
//! Handshaking ──► Syncing ──► Running
//!      │             │           │
//!      └─────────────┴───────────┴──► Closed(reason)
//! ```
//!
//! | From        | To      | Trigger                                              |
//! |-------------|---------|------------------------------------------------------|
//! | Handshaking | Syncing | Valid handshake received (and answered, if accepting)|
//! | Syncing     | Running | Session exchanged `Sync`/`SyncAck` over it           |
//! | any         | Closed  | Socket error, EOF, `Goodbye`, bad data or `close()`  |

use std::fmt;

/// Where a [`Connection`](crate::Connection) is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the peer's handshake.
    Handshaking,
    /// Handshake complete; the session is agreeing on the start frame.
    Syncing,
    /// Frame data may flow.
    Running,
    /// Terminal. Nothing more is sent; queued inbound messages may still be drained.
    Closed(CloseReason),
}

impl ConnectionState {
    /// Returns `true` unless the state is [`ConnectionState::Closed`].
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Closed(_))
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CloseReason {
    /// Closed by the local side.
    LocalClose,
    /// The peer said goodbye or closed the stream.
    PeerClosed,
    /// Wrong magic, data before the handshake, or handshake timeout.
    HandshakeFailed {
        /// What went wrong.
        reason: String,
    },
    /// Versions (or the delay depth) could not be reconciled.
    ProtocolMismatch {
        /// Our value.
        local: u32,
        /// The peer's value.
        remote: u32,
    },
    /// The peer sent bytes that do not decode.
    Malformed {
        /// The decoder's complaint.
        reason: String,
    },
    /// The transport failed.
    SocketError {
        /// The I/O error, rendered.
        context: String,
    },
    /// The host already has a primary peer, or its spectator slots are full.
    Rejected,
    /// Remote input did not arrive within the stall timeout.
    Stalled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalClose => write!(f, "closed locally"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::HandshakeFailed { reason } => write!(f, "handshake failed: {}", reason),
            Self::ProtocolMismatch { local, remote } => {
                write!(f, "protocol mismatch (local {}, remote {})", local, remote)
            },
            Self::Malformed { reason } => write!(f, "malformed data: {}", reason),
            Self::SocketError { context } => write!(f, "socket error: {}", context),
            Self::Rejected => write!(f, "rejected by host"),
            Self::Stalled => write!(f, "stalled"),
        }
    }
}
