//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! of lockstep-netplay, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use lockstep_netplay::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Session types**: [`NetplaySession`], [`SessionBuilder`], [`netplay_new`], [`netplay_free`] and the other `netplay_*` functions
//! - **Callbacks**: [`RetroCallbacks`], [`CallbackInterceptor`]
//! - **Transports**: [`TcpTransport`], [`TcpAcceptor`], [`LoopbackTransport`]
//! - **Fundamental types**: [`Frame`], [`Port`], [`FrameRecord`], [`PortDriver`]
//! - **Session state and events**: [`SessionRole`], [`SessionState`], [`NetplayEvent`]
//! - **Error handling**: [`NetplayError`], [`NetplayResult`]
//! - **Configuration**: [`NetplayConfig`], [`StallPolicy`], [`SpectatorFeed`]
//! - **Network monitoring**: [`NetworkStats`]
//!
//! # Example
//!
//! ```rust
//! use lockstep_netplay::prelude::*;
//!
//! struct Pad {
//!     a_held: bool,
//! }
//!
//! impl RetroCallbacks for Pad {
//!     fn poll_input(&mut self) {}
//!     fn input_state(&mut self, port: u32, device: u32, _index: u32, id: u32) -> i16 {
//!         i16::from(port == 0 && device == DEVICE_JOYPAD && id == JOYPAD_A && self.a_held)
//!     }
//!     fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {}
//!     fn audio_sample(&mut self, _: i16, _: i16) {}
//!     fn audio_sample_batch(&mut self, samples: &[i16]) -> usize { samples.len() / 2 }
//! }
//!
//! let (to_host, _host_end) = LoopbackTransport::pair();
//! let session = SessionBuilder::new()
//!     .with_config(NetplayConfig::lan())?
//!     .start_client(Pad { a_held: false }, to_host)?;
//! assert_eq!(session.local_port(), Some(Port::new(1)));
//! # Ok::<(), NetplayError>(())
//! ```

// Core session types
pub use crate::sessions::builder::{
    netplay_flip_users, netplay_free, netplay_new, netplay_post_frame, netplay_pre_frame,
    SessionBuilder,
};
pub use crate::sessions::netplay_session::NetplaySession;

// Callbacks and the device constants a frontend needs to answer them
pub use crate::callbacks::{
    CallbackInterceptor, RetroCallbacks, DEVICE_ANALOG, DEVICE_JOYPAD, DEVICE_KEYBOARD,
    JOYPAD_A, JOYPAD_B, JOYPAD_DOWN, JOYPAD_LEFT, JOYPAD_RIGHT, JOYPAD_SELECT, JOYPAD_START,
    JOYPAD_UP,
};

// Transports
pub use crate::network::loopback::LoopbackTransport;
pub use crate::network::tcp_stream::{TcpAcceptor, TcpTransport};
pub use crate::{StreamAcceptor, Transport};

// Fundamental types and constants
pub use crate::{Frame, FrameRecord, Port, PortDriver, NUM_PORTS};

// Session state and events
pub use crate::{NetplayEvent, SessionRole, SessionState};

// Error handling
pub use crate::{NetplayError, NetplayResult};

// Configuration
pub use crate::sessions::config::{NetplayConfig, SpectatorFeed, StallPolicy};

// Network monitoring
pub use crate::NetworkStats;
