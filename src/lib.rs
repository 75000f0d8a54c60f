//! # lockstep-netplay
//!
//! Deterministic lockstep input synchronization for libretro-style frontends.
//!
//! Two instances of a deterministic simulation (an emulator core, a game loop) are
//! kept bit-identical by exchanging only per-tick controller input over a reliable
//! ordered byte stream. A fixed *delay depth* of ticks hides network latency:
//! input captured on tick `f` is applied on tick `f + delay_depth` on every peer.
//! Nothing is predicted and nothing is rolled back; a tick is only executed once
//! every port's input for it is known.
//!
//! The simulation loop drives a [`NetplaySession`] with two calls per tick:
//!
//! ```no_run
//! use lockstep_netplay::prelude::*;
//! # struct Core;
//! # impl RetroCallbacks for Core {
//! #     fn poll_input(&mut self) {}
//! #     fn input_state(&mut self, _: u32, _: u32, _: u32, _: u32) -> i16 { 0 }
//! #     fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {}
//! #     fn audio_sample(&mut self, _: i16, _: i16) {}
//! #     fn audio_sample_batch(&mut self, s: &[i16]) -> usize { s.len() / 2 }
//! # }
//! # fn run_core_tick(_: &mut CallbackInterceptor<Core>) {}
//! let mut session = netplay_new(None, 55435, 3, Core, false, "host")?;
//! loop {
//!     match session.pre_frame() {
//!         Ok(()) => {
//!             run_core_tick(session.interceptor_mut());
//!             session.post_frame()?;
//!         },
//!         Err(NetplayError::NotSynchronized) => {},
//!         Err(e) if e.is_fatal() => return Err(e),
//!         Err(_) => {},
//!     }
//!     for event in session.events() {
//!         println!("{}", event.status_text());
//!     }
//! }
//! # Ok::<(), NetplayError>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::io;

pub use callbacks::{
    CallbackInterceptor, InterceptMode, PresentationStats, PresentationTap, RetroCallbacks,
};
pub use delay_buffer::DelayBuffer;
pub use error::{InvalidRequestKind, NetplayError, NetplayResult};
pub use frame_record::FrameRecord;
pub use network::connection::state::{CloseReason, ConnectionState};
pub use network::connection::Connection;
pub use network::loopback::{LoopbackAcceptor, LoopbackConnector, LoopbackTransport};
pub use network::messages::{Handshake, Message};
pub use network::network_stats::NetworkStats;
pub use network::tcp_stream::{TcpAcceptor, TcpTransport};
pub use sessions::builder::{
    netplay_flip_users, netplay_free, netplay_new, netplay_post_frame, netplay_pre_frame,
    SessionBuilder,
};
pub use sessions::config::{NetplayConfig, SpectatorFeed, StallPolicy};
pub use sessions::event_drain::EventDrain;
pub use sessions::netplay_session::NetplaySession;
pub use sessions::port_assignment::PortAssignment;

pub mod callbacks;
#[doc(hidden)]
pub mod delay_buffer;
#[doc(hidden)]
pub mod error;
pub mod frame_record;
pub mod prelude;
pub mod telemetry;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod event_drain;
    #[doc(hidden)]
    pub mod netplay_session;
    #[doc(hidden)]
    pub mod port_assignment;
}
#[doc(hidden)]
pub mod network {
    /// Wire codec: length-prefixed bincode message framing.
    pub mod codec;
    #[doc(hidden)]
    pub mod connection;
    pub mod loopback;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    pub mod tcp_stream;
}

/// Internal module exposing implementation details for testing and fuzzing.
///
/// **This module is NOT part of the public API.** Nothing here is covered by
/// semver guarantees. It exists so that fuzz targets and property tests can drive
/// the delay buffer, the codec and the port assignment directly.
#[doc(hidden)]
pub mod __internal {
    pub use crate::network::codec::{decode, encode, DecodeError, EncodeError, MAX_MESSAGE_SIZE};
    pub use crate::network::messages::{MAGIC, MAX_NICKNAME_LEN, PROTOCOL_VERSION};
    pub use crate::sessions::port_assignment::PortAssignment;
}

// #############
// # CONSTANTS #
// #############

/// Number of logical input ports that take part in netplay.
pub const NUM_PORTS: usize = 2;

/// The physical device port the local player's controller is read from.
pub const LOCAL_DEVICE_PORT: u32 = 0;

/// The largest delay depth a session will run with or accept from a peer.
pub const MAX_DELAY_DEPTH: u32 = 32;

/// A frame is a single tick of the simulation.
///
/// Frame numbers start at the session's start frame (0 for players, the join
/// frame for spectators) and increase by one per tick. A [`FrameRecord`] carries
/// the frame during which it was captured; it is applied `delay_depth` frames later.
///
/// # Examples
///
/// ```
/// use lockstep_netplay::Frame;
///
/// let frame = Frame::new(4);
/// assert_eq!(frame.next(), Frame::new(5));
/// assert_eq!(frame.checked_sub(3), Some(Frame::new(1)));
/// assert_eq!(frame.checked_sub(5), None);
/// assert_eq!((frame + 2).as_u64(), 6);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(u64);

impl Frame {
    /// The first frame of a session.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from a `u64` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u64) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `u64` value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following frame.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Frame(self.0.saturating_add(1))
    }

    /// Subtracts `ticks`, returning `None` if the result would precede frame 0.
    #[inline]
    #[must_use]
    pub const fn checked_sub(self, ticks: u64) -> Option<Frame> {
        match self.0.checked_sub(ticks) {
            Some(f) => Some(Frame(f)),
            None => None,
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u64> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Frame(self.0.saturating_add(rhs))
    }
}

impl std::ops::AddAssign<u64> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl From<u64> for Frame {
    #[inline]
    fn from(value: u64) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u64 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// A logical simulation input port taking part in netplay.
///
/// Ports `0..NUM_PORTS` are netplay ports; the host drives port 0 and the client
/// port 1 until the users are flipped.
///
/// ```
/// use lockstep_netplay::Port;
///
/// assert_eq!(Port::new(0).other(), Port::new(1));
/// assert_eq!(Port::all().count(), 2);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Port(u8);

impl Port {
    /// Creates a new `Port`. Use [`Port::is_valid`] to check it is a netplay port.
    #[inline]
    #[must_use]
    pub const fn new(port: u8) -> Self {
        Port(port)
    }

    /// Returns the port as an index into per-port arrays.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if this port is in `0..NUM_PORTS`.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < NUM_PORTS
    }

    /// The opposite port of a two-port session.
    #[inline]
    #[must_use]
    pub const fn other(self) -> Self {
        Port(1 - (self.0 & 1))
    }

    /// Iterates over all netplay ports in order.
    pub fn all() -> impl Iterator<Item = Port> {
        (0..NUM_PORTS as u8).map(Port)
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// #############
// #   ENUMS   #
// #############

/// The part a session plays in a netplay match, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Accepts the primary peer and drives port 0.
    Host,
    /// Connects to a host and drives port 1.
    Client,
    /// Host in spectate mode: drives every port locally and streams combined input to spectators.
    SpectatorSource,
    /// Client in spectate mode: receives the combined stream and never drives a port.
    SpectatorSink,
}

impl SessionRole {
    /// Returns `true` for the roles that accept incoming connections.
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host | Self::SpectatorSource)
    }
}

/// A session is always in one of these states. Query it with [`NetplaySession::current_state`].
///
/// ```text
/// Handshaking ──► Syncing ──► Running ◄──► Flipping
///                                │
///                                ▼
///                             Degraded ──► Closed
/// ```
///
/// Every state can move to `Closed` on a fatal error or an explicit free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for (host) or exchanging (client) handshake messages.
    Handshaking,
    /// Handshake done, waiting for both sides to acknowledge the start frame.
    Syncing,
    /// Steady-state lockstep.
    Running,
    /// A user flip was requested locally and the peer has not acknowledged it yet.
    Flipping {
        /// The first frame captured with the swapped port assignment.
        effective_frame: Frame,
    },
    /// The primary peer is gone; remote ports receive neutral input.
    Degraded,
    /// Terminal. Further `pre_frame`/`post_frame` calls fail with [`NetplayError::SessionClosed`].
    Closed,
}

/// Who supplies the input for a port at a given frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDriver {
    /// The local device.
    Local,
    /// A remote peer (or the host's combined stream, for spectators).
    Remote,
}

/// Notifications a session emits for the presentation layer.
///
/// Drain them with [`NetplaySession::events`]; [`NetplayEvent::status_text`] gives a
/// line suitable for an on-screen message.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new events may be added.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// A peer completed its handshake.
    PeerConnected {
        /// The nickname the peer announced.
        nickname: String,
        /// Whether it joined as a spectator.
        spectate: bool,
    },
    /// Both sides agreed on the start frame; ticks may run.
    Synchronized {
        /// The first frame this session simulates.
        start_frame: Frame,
    },
    /// A spectator joined and will receive combined input from `start_frame` on.
    SpectatorJoined {
        /// The spectator's nickname.
        nickname: String,
        /// The first combined record it receives.
        start_frame: Frame,
    },
    /// A spectator connection was closed.
    SpectatorLeft {
        /// The spectator's nickname.
        nickname: String,
        /// Why the connection closed.
        reason: CloseReason,
    },
    /// The primary peer connection was closed.
    PeerDisconnected {
        /// The peer's nickname.
        nickname: String,
        /// Why the connection closed.
        reason: CloseReason,
    },
    /// Remote input for `frame` did not arrive within the stall timeout.
    ConnectionStalled {
        /// The frame whose remote input is missing.
        frame: Frame,
        /// How long the session waited.
        waited_ms: u128,
    },
    /// The session continues without its primary peer.
    Degraded {
        /// The first frame resolved without the peer.
        frame: Frame,
    },
    /// The port assignment was swapped.
    UsersFlipped {
        /// The first frame captured with the new assignment.
        effective_frame: Frame,
    },
    /// The peers disagree about the frame history; the session is closed.
    DesyncDetected {
        /// Where the disagreement was detected.
        frame: Frame,
        /// Description of the disagreement.
        reason: String,
    },
    /// The smoothed round-trip estimate to the primary peer changed.
    PingUpdated {
        /// The new estimate in milliseconds.
        ping_ms: u32,
    },
}

impl NetplayEvent {
    /// A short human-readable line describing the event.
    #[must_use]
    pub fn status_text(&self) -> String {
        match self {
            Self::PeerConnected { nickname, spectate } => {
                if *spectate {
                    format!("{} connected as a spectator", nickname)
                } else {
                    format!("{} connected", nickname)
                }
            },
            Self::Synchronized { start_frame } => {
                format!("Netplay synchronized at frame {}", start_frame)
            },
            Self::SpectatorJoined {
                nickname,
                start_frame,
            } => format!("{} is spectating from frame {}", nickname, start_frame),
            Self::SpectatorLeft { nickname, reason } => {
                format!("Spectator {} left ({})", nickname, reason)
            },
            Self::PeerDisconnected { nickname, reason } => {
                format!("{} disconnected ({})", nickname, reason)
            },
            Self::ConnectionStalled { frame, waited_ms } => format!(
                "Waiting for remote input for frame {} ({} ms)",
                frame, waited_ms
            ),
            Self::Degraded { frame } => {
                format!("Netplay lost at frame {}, continuing locally", frame)
            },
            Self::UsersFlipped { effective_frame } => {
                format!("Users flipped starting at frame {}", effective_frame)
            },
            Self::DesyncDetected { frame, reason } => {
                format!("Netplay desync at frame {}: {}", frame, reason)
            },
            Self::PingUpdated { ping_ms } => format!("Ping: {} ms", ping_ms),
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// A reliable, ordered, non-blocking byte stream to one peer.
///
/// Reads return [`io::ErrorKind::WouldBlock`] when no data is available and
/// `Ok(0)` once the peer has closed its end. Writes may accept fewer bytes than
/// offered or return `WouldBlock`; the [`Connection`] keeps the remainder queued.
///
/// Every `Read + Write + Send` type is a transport; [`TcpTransport`] and
/// [`LoopbackTransport`] are provided.
pub trait Transport: io::Read + io::Write + Send {}

impl<T> Transport for T where T: io::Read + io::Write + Send {}

/// A non-blocking source of incoming byte streams, polled by hosting sessions.
pub trait StreamAcceptor: Send {
    /// Returns the next pending stream, or `Ok(None)` if nobody is waiting.
    fn accept_stream(&mut self) -> io::Result<Option<Box<dyn Transport>>>;
}

// ###################
// # UNIT TESTS      #
// ###################

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
    fn frame_arithmetic_saturates() {
        assert_eq!(Frame::new(u64::MAX).next(), Frame::new(u64::MAX));
        assert_eq!(Frame::ZERO.checked_sub(1), None);
        let mut f = Frame::new(7);
        f += 3;
        assert_eq!(f, Frame::new(10));
    }

    #[test]
    fn port_other_is_involution() {
        for port in Port::all() {
            assert!(port.is_valid());
            assert_eq!(port.other().other(), port);
            assert_ne!(port.other(), port);
        }
        assert!(!Port::new(2).is_valid());
    }

    #[test]
    fn status_text_mentions_nickname() {
        let event = NetplayEvent::PeerDisconnected {
            nickname: "bob".to_owned(),
            reason: CloseReason::PeerClosed,
        };
        assert!(event.status_text().contains("bob"));
        let event = NetplayEvent::PeerConnected {
            nickname: "eve".to_owned(),
            spectate: true,
        };
        assert_eq!(event.status_text(), "eve connected as a spectator");
    }

    #[test]
    fn host_roles() {
        assert!(SessionRole::Host.is_host());
        assert!(SessionRole::SpectatorSource.is_host());
        assert!(!SessionRole::Client.is_host());
        assert!(!SessionRole::SpectatorSink.is_host());
    }
}
