//! Configuration types for netplay sessions.
//!
//! | Type            | Purpose                                         |
//! |-----------------|-------------------------------------------------|
//! | `NetplayConfig` | Every tunable of a session; presets below       |
//! | `StallPolicy`   | What `pre_frame` does when remote input is late |
//! | `SpectatorFeed` | What a spectator's simulation is shown          |
//!
//! # Example
//!
//! ```
//! use lockstep_netplay::{NetplayConfig, SessionBuilder, StallPolicy};
//! use web_time::Duration;
//!
//! let config = NetplayConfig {
//!     stall_policy: StallPolicy::Wait,
//!     stall_timeout: Duration::from_millis(750),
//!     ..NetplayConfig::internet()
//! };
//! let builder = SessionBuilder::new().with_config(config)?;
//! # Ok::<(), lockstep_netplay::NetplayError>(())
//! ```

use web_time::Duration;

use crate::{InvalidRequestKind, NetplayError, MAX_DELAY_DEPTH};

/// What `pre_frame` does once remote input has been missing for `stall_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StallPolicy {
    /// Report [`NetplayError::ConnectionStalled`] and keep the peer; the caller
    /// retries `pre_frame` on its next tick.
    Wait,
    /// Close the stalled peer, keep serving spectators and continue locally with
    /// neutral input on the remote ports.
    #[default]
    DropPeer,
}

/// What a spectator sink's simulation sees through `input_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpectatorFeed {
    /// Always neutral. The combined records are still decoded and exposed through
    /// [`NetplaySession::spectated_inputs`](crate::NetplaySession::spectated_inputs).
    #[default]
    Neutral,
    /// Answer input queries from the host's combined records, replaying the match.
    Replay,
}

/// Tunables for a netplay session.
///
/// # Forward Compatibility
///
/// New fields may be added. Construct with `..NetplayConfig::default()` or a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "NetplayConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct NetplayConfig {
    /// Ticks between capturing an input and applying it. The host's value wins.
    ///
    /// Default: 2
    pub delay_depth: u32,
    /// Largest host delay depth a client accepts; a deeper host is a protocol mismatch.
    ///
    /// Default: [`MAX_DELAY_DEPTH`]
    pub max_adopted_delay_depth: u32,
    /// How long `pre_frame` waits for missing remote input before applying `stall_policy`.
    ///
    /// Default: 500ms
    pub stall_timeout: Duration,
    /// Sleep between polls while waiting for remote input.
    ///
    /// Default: 1ms
    pub stall_poll_interval: Duration,
    /// See [`StallPolicy`].
    ///
    /// Default: [`StallPolicy::DropPeer`]
    pub stall_policy: StallPolicy,
    /// A connection that has not finished handshake and sync within this time is closed.
    ///
    /// Default: 10s
    pub handshake_timeout: Duration,
    /// Frames between pings to each peer.
    ///
    /// Default: 60
    pub ping_interval_frames: u32,
    /// See [`SpectatorFeed`].
    ///
    /// Default: [`SpectatorFeed::Neutral`]
    pub spectator_feed: SpectatorFeed,
    /// Spectators a host serves at once. Further spectators are rejected.
    ///
    /// Default: 8
    pub max_spectators: usize,
    /// Undrained events kept; the oldest are dropped beyond this.
    ///
    /// Default: 100
    pub event_queue_size: usize,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            delay_depth: 2,
            max_adopted_delay_depth: MAX_DELAY_DEPTH,
            stall_timeout: Duration::from_millis(500),
            stall_poll_interval: Duration::from_millis(1),
            stall_policy: StallPolicy::DropPeer,
            handshake_timeout: Duration::from_secs(10),
            ping_interval_frames: 60,
            spectator_feed: SpectatorFeed::Neutral,
            max_spectators: 8,
            event_queue_size: 100,
        }
    }
}

impl NetplayConfig {
    /// Creates a new `NetplayConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: one tick of delay, short stall timeout.
    pub fn lan() -> Self {
        Self {
            delay_depth: 1,
            stall_timeout: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Preset for typical internet play (30-80ms RTT at 60 ticks per second).
    pub fn internet() -> Self {
        Self {
            delay_depth: 3,
            stall_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Preset for 100-250ms RTT links: deep delay, patient stalls.
    pub fn high_latency() -> Self {
        Self {
            delay_depth: 8,
            stall_timeout: Duration::from_secs(3),
            stall_poll_interval: Duration::from_millis(2),
            handshake_timeout: Duration::from_secs(20),
            ping_interval_frames: 120,
            ..Self::default()
        }
    }

    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.delay_depth > MAX_DELAY_DEPTH {
            return Err(InvalidRequestKind::DelayDepthTooLarge {
                depth: self.delay_depth,
                max: MAX_DELAY_DEPTH,
            }
            .into());
        }
        if self.max_adopted_delay_depth > MAX_DELAY_DEPTH {
            return Err(InvalidRequestKind::DelayDepthTooLarge {
                depth: self.max_adopted_delay_depth,
                max: MAX_DELAY_DEPTH,
            }
            .into());
        }
        if self.stall_poll_interval.is_zero() {
            return Err(InvalidRequestKind::InvalidConfig {
                field: "stall_poll_interval",
                reason: "must be greater than zero",
            }
            .into());
        }
        if self.handshake_timeout.is_zero() {
            return Err(InvalidRequestKind::InvalidConfig {
                field: "handshake_timeout",
                reason: "must be greater than zero",
            }
            .into());
        }
        if self.ping_interval_frames == 0 {
            return Err(InvalidRequestKind::InvalidConfig {
                field: "ping_interval_frames",
                reason: "must be at least 1",
            }
            .into());
        }
        if self.event_queue_size == 0 {
            return Err(InvalidRequestKind::InvalidConfig {
                field: "event_queue_size",
                reason: "must be at least 1",
            }
            .into());
        }
        Ok(())
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
    fn presets_are_valid() {
        for config in [
            NetplayConfig::default(),
            NetplayConfig::lan(),
            NetplayConfig::internet(),
            NetplayConfig::high_latency(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn presets_order_by_delay() {
        assert!(NetplayConfig::lan().delay_depth < NetplayConfig::internet().delay_depth);
        assert!(NetplayConfig::internet().delay_depth < NetplayConfig::high_latency().delay_depth);
    }

    #[test]
    fn default_policy_drops_peer() {
        assert_eq!(NetplayConfig::default().stall_policy, StallPolicy::DropPeer);
        assert_eq!(NetplayConfig::default().spectator_feed, SpectatorFeed::Neutral);
    }

    #[test]
    fn too_deep_is_rejected() {
        let config = NetplayConfig {
            delay_depth: MAX_DELAY_DEPTH + 1,
            ..NetplayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::DelayDepthTooLarge { .. }
            })
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = NetplayConfig {
            stall_poll_interval: Duration::ZERO,
            ..NetplayConfig::default()
        };
        assert!(config.validate().is_err());
        let config = NetplayConfig {
            ping_interval_frames: 0,
            ..NetplayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
