//! The simulation's callback surface and the interceptor that substitutes netplay
//! input for live device input.
//!
//! The simulation is handed a [`CallbackInterceptor`] wherever it would take the
//! frontend's callbacks. During a tick, input queries for netplay ports are
//! answered from the records the session resolved in `pre_frame`; everything else
//! passes through to the genuine callbacks.
//!
//! # Example
//!
//! ```
//! use lockstep_netplay::callbacks::{self, CallbackInterceptor, InterceptMode, RetroCallbacks};
//! use lockstep_netplay::{Frame, FrameRecord, SpectatorFeed};
//!
//! #[derive(Default)]
//! struct Pad { a_held: bool }
//!
//! impl RetroCallbacks for Pad {
//!     fn poll_input(&mut self) {}
//!     fn input_state(&mut self, port: u32, device: u32, _index: u32, id: u32) -> i16 {
//!         i16::from(port == 0 && device == callbacks::DEVICE_JOYPAD && id == callbacks::JOYPAD_A && self.a_held)
//!     }
//!     fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {}
//!     fn audio_sample(&mut self, _: i16, _: i16) {}
//!     fn audio_sample_batch(&mut self, samples: &[i16]) -> usize { samples.len() / 2 }
//! }
//!
//! let mut interceptor = CallbackInterceptor::new(Pad { a_held: true }, InterceptMode::Net, SpectatorFeed::Neutral);
//! let captured = interceptor.capture(Frame::new(0));
//! assert!(captured.button(callbacks::JOYPAD_A));
//!
//! // Outside of a resolved tick, netplay ports read as neutral.
//! assert_eq!(interceptor.input_state(0, callbacks::DEVICE_JOYPAD, 0, callbacks::JOYPAD_A), 0);
//! interceptor.set_resolved([captured, FrameRecord::neutral(Frame::new(0))]);
//! assert_eq!(interceptor.input_state(0, callbacks::DEVICE_JOYPAD, 0, callbacks::JOYPAD_A), 1);
//! ```

use tracing::trace;

use crate::frame_record::{FrameRecord, ANALOG_AXES, JOYPAD_BUTTONS, KEY_COUNT};
use crate::sessions::config::SpectatorFeed;
use crate::{Frame, LOCAL_DEVICE_PORT, NUM_PORTS};

/// No device.
pub const DEVICE_NONE: u32 = 0;
/// Digital joypad.
pub const DEVICE_JOYPAD: u32 = 1;
/// Relative mouse.
pub const DEVICE_MOUSE: u32 = 2;
/// Keyboard; the id is the key code.
pub const DEVICE_KEYBOARD: u32 = 3;
/// Light gun.
pub const DEVICE_LIGHTGUN: u32 = 4;
/// Joypad with two analog sticks; index selects the stick, id the axis.
pub const DEVICE_ANALOG: u32 = 5;
/// Device subclasses keep the base type in their low byte.
pub const DEVICE_TYPE_MASK: u32 = 0xff;

/// Joypad B.
pub const JOYPAD_B: u32 = 0;
/// Joypad Y.
pub const JOYPAD_Y: u32 = 1;
/// Joypad SELECT.
pub const JOYPAD_SELECT: u32 = 2;
/// Joypad START.
pub const JOYPAD_START: u32 = 3;
/// Joypad UP.
pub const JOYPAD_UP: u32 = 4;
/// Joypad DOWN.
pub const JOYPAD_DOWN: u32 = 5;
/// Joypad LEFT.
pub const JOYPAD_LEFT: u32 = 6;
/// Joypad RIGHT.
pub const JOYPAD_RIGHT: u32 = 7;
/// Joypad A.
pub const JOYPAD_A: u32 = 8;
/// Joypad X.
pub const JOYPAD_X: u32 = 9;
/// Joypad L.
pub const JOYPAD_L: u32 = 10;
/// Joypad R.
pub const JOYPAD_R: u32 = 11;
/// Joypad L2.
pub const JOYPAD_L2: u32 = 12;
/// Joypad R2.
pub const JOYPAD_R2: u32 = 13;
/// Joypad L3.
pub const JOYPAD_L3: u32 = 14;
/// Joypad R3.
pub const JOYPAD_R3: u32 = 15;

/// Analog index of the left stick.
pub const ANALOG_INDEX_LEFT: u32 = 0;
/// Analog index of the right stick.
pub const ANALOG_INDEX_RIGHT: u32 = 1;
/// Analog id of the horizontal axis.
pub const ANALOG_ID_X: u32 = 0;
/// Analog id of the vertical axis.
pub const ANALOG_ID_Y: u32 = 1;

const ANALOG_STICKS: u32 = (ANALOG_AXES as u32) / 2;

/// The five callbacks a libretro-style simulation drives its frontend through.
pub trait RetroCallbacks {
    /// Refreshes device state. Called by the simulation once per tick.
    fn poll_input(&mut self);

    /// Reads one input: button, axis or key, selected by `device`, `index` and `id`.
    fn input_state(&mut self, port: u32, device: u32, index: u32, id: u32) -> i16;

    /// Presents a frame. `None` repeats the previous frame.
    fn video_frame(&mut self, data: Option<&[u8]>, width: u32, height: u32, pitch: usize);

    /// Plays one stereo sample.
    fn audio_sample(&mut self, left: i16, right: i16);

    /// Plays interleaved stereo samples; returns the number of frames consumed.
    fn audio_sample_batch(&mut self, samples: &[i16]) -> usize;
}

/// Which substitution the interceptor performs. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptMode {
    /// Host or client: netplay ports are answered from the resolved records.
    Net,
    /// Spectator source: like `Net`, with every netplay port captured locally.
    SpectateSource,
    /// Spectator sink: input is neutral, or replayed from the combined stream.
    SpectateSink,
}

/// Receives a copy of the presentation output while spectators are being served.
pub trait PresentationTap: Send {
    /// A video frame was presented. `None` repeats the previous frame.
    fn video_frame(&mut self, data: Option<&[u8]>, width: u32, height: u32, pitch: usize);

    /// Interleaved stereo samples were played.
    fn audio_samples(&mut self, samples: &[i16]);
}

/// Counters of the presentation output seen while the tap was active.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresentationStats {
    /// Frames presented, duplicates included.
    pub video_frames: u64,
    /// Frames presented as "repeat the previous frame".
    pub duplicate_video_frames: u64,
    /// Stereo sample frames played.
    pub audio_frames: u64,
}

/// Wraps the frontend's callbacks and answers the simulation's input queries
/// from netplay records.
pub struct CallbackInterceptor<C> {
    callbacks: C,
    mode: InterceptMode,
    spectator_feed: SpectatorFeed,
    resolved: Option<[FrameRecord; NUM_PORTS]>,
    polled_this_tick: bool,
    tap: Option<Box<dyn PresentationTap>>,
    tap_active: bool,
    stats: PresentationStats,
}

impl<C> std::fmt::Debug for CallbackInterceptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            callbacks: _,
            mode,
            spectator_feed,
            resolved,
            polled_this_tick,
            tap,
            tap_active,
            stats,
        } = self;

        f.debug_struct("CallbackInterceptor")
            .field("mode", mode)
            .field("spectator_feed", spectator_feed)
            .field("resolved", resolved)
            .field("polled_this_tick", polled_this_tick)
            .field("has_tap", &tap.is_some())
            .field("tap_active", tap_active)
            .field("stats", stats)
            .finish_non_exhaustive()
    }
}

impl<C: RetroCallbacks> CallbackInterceptor<C> {
    /// Wraps `callbacks`.
    pub fn new(callbacks: C, mode: InterceptMode, spectator_feed: SpectatorFeed) -> Self {
        Self {
            callbacks,
            mode,
            spectator_feed,
            resolved: None,
            polled_this_tick: false,
            tap: None,
            tap_active: false,
            stats: PresentationStats::default(),
        }
    }

    /// The substitution mode.
    #[must_use]
    pub const fn mode(&self) -> InterceptMode {
        self.mode
    }

    /// The genuine callbacks.
    #[must_use]
    pub const fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// The genuine callbacks, mutably.
    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// Unwraps the genuine callbacks.
    pub fn into_inner(self) -> C {
        self.callbacks
    }

    /// The records applied this tick, once resolved.
    #[must_use]
    pub const fn resolved(&self) -> Option<&[FrameRecord; NUM_PORTS]> {
        self.resolved.as_ref()
    }

    /// Installs the records input queries are answered from until the next call.
    pub fn set_resolved(&mut self, records: [FrameRecord; NUM_PORTS]) {
        self.resolved = Some(records);
        self.polled_this_tick = false;
    }

    /// Starts or stops copying presentation output into the tap.
    pub fn set_tap_active(&mut self, active: bool) {
        self.tap_active = active;
    }

    /// Installs a presentation tap, replacing any previous one.
    pub fn set_presentation_tap(&mut self, tap: Box<dyn PresentationTap>) {
        self.tap = Some(tap);
    }

    /// Output counters since construction.
    #[must_use]
    pub const fn presentation_stats(&self) -> PresentationStats {
        self.stats
    }

    /// Reads the local controller into a record stamped with `frame`.
    pub fn capture(&mut self, frame: Frame) -> FrameRecord {
        self.capture_port(LOCAL_DEVICE_PORT, frame)
    }

    /// Reads physical device port `port` into a record stamped with `frame`.
    ///
    /// Polls the device first unless the simulation already polled this tick.
    pub fn capture_port(&mut self, port: u32, frame: Frame) -> FrameRecord {
        if !self.polled_this_tick {
            self.callbacks.poll_input();
            self.polled_this_tick = true;
        }
        let mut record = FrameRecord::neutral(frame);
        for id in 0..JOYPAD_BUTTONS {
            if self.callbacks.input_state(port, DEVICE_JOYPAD, 0, id) != 0 {
                record.set_button(id, true);
            }
        }
        for index in 0..ANALOG_STICKS {
            for id in [ANALOG_ID_X, ANALOG_ID_Y] {
                let value = self.callbacks.input_state(port, DEVICE_ANALOG, index, id);
                record.set_analog_axis((index * 2 + id) as usize, value);
            }
        }
        for code in 0..KEY_COUNT {
            if self.callbacks.input_state(port, DEVICE_KEYBOARD, 0, code) != 0 {
                record.set_key(code, true);
            }
        }
        trace!("Captured device port {} for frame {}", port, frame);
        record
    }

    /// Polls the genuine device.
    pub fn input_poll_net(&mut self) {
        self.callbacks.poll_input();
        self.polled_this_tick = true;
    }

    /// Answers an input query during a netplay tick.
    ///
    /// Netplay ports read the resolved record: joypad buttons, analog axes and
    /// keys; any other device reads 0. Other ports pass through.
    pub fn input_state_net(&mut self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        if port as usize >= NUM_PORTS {
            return self.callbacks.input_state(port, device, index, id);
        }
        self.resolved_state(port, device, index, id)
    }

    fn resolved_state(&self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        let Some(record) = self
            .resolved
            .as_ref()
            .and_then(|records| records.get(port as usize))
        else {
            return 0;
        };
        match device & DEVICE_TYPE_MASK {
            DEVICE_JOYPAD if id < JOYPAD_BUTTONS => i16::from(record.button(id)),
            DEVICE_ANALOG if index < ANALOG_STICKS && id <= ANALOG_ID_Y => {
                record.analog_axis((index * 2 + id) as usize)
            },
            DEVICE_KEYBOARD if id < KEY_COUNT => i16::from(record.key(id)),
            _ => 0,
        }
    }

    /// Presents a frame and copies it to the tap while spectators are served.
    pub fn video_frame_net(&mut self, data: Option<&[u8]>, width: u32, height: u32, pitch: usize) {
        self.callbacks.video_frame(data, width, height, pitch);
        if self.tap_active {
            self.stats.video_frames += 1;
            if data.is_none() {
                self.stats.duplicate_video_frames += 1;
            }
            if let Some(tap) = self.tap.as_mut() {
                tap.video_frame(data, width, height, pitch);
            }
        }
    }

    /// Plays one sample and copies it to the tap while spectators are served.
    pub fn audio_sample_net(&mut self, left: i16, right: i16) {
        self.callbacks.audio_sample(left, right);
        if self.tap_active {
            self.stats.audio_frames += 1;
            if let Some(tap) = self.tap.as_mut() {
                tap.audio_samples(&[left, right]);
            }
        }
    }

    /// Plays a batch and copies it to the tap while spectators are served.
    pub fn audio_sample_batch_net(&mut self, samples: &[i16]) -> usize {
        let consumed = self.callbacks.audio_sample_batch(samples);
        if self.tap_active {
            self.stats.audio_frames += (samples.len() / 2) as u64;
            if let Some(tap) = self.tap.as_mut() {
                tap.audio_samples(samples);
            }
        }
        consumed
    }

    /// Spectator source queries: always neutral.
    pub fn input_state_spectate(&mut self, _port: u32, _device: u32, _index: u32, _id: u32) -> i16 {
        0
    }

    /// Spectator sink queries: neutral, unless the feed replays the combined stream.
    pub fn input_state_spectate_client(&mut self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        match self.spectator_feed {
            SpectatorFeed::Neutral => 0,
            SpectatorFeed::Replay => self.resolved_state(port, device, index, id),
        }
    }
}

impl<C: RetroCallbacks> RetroCallbacks for CallbackInterceptor<C> {
    fn poll_input(&mut self) {
        self.input_poll_net();
    }

    fn input_state(&mut self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        match self.mode {
            InterceptMode::Net | InterceptMode::SpectateSource => {
                self.input_state_net(port, device, index, id)
            },
            InterceptMode::SpectateSink => self.input_state_spectate_client(port, device, index, id),
        }
    }

    fn video_frame(&mut self, data: Option<&[u8]>, width: u32, height: u32, pitch: usize) {
        self.video_frame_net(data, width, height, pitch);
    }

    fn audio_sample(&mut self, left: i16, right: i16) {
        self.audio_sample_net(left, right);
    }

    fn audio_sample_batch(&mut self, samples: &[i16]) -> usize {
        self.audio_sample_batch_net(samples)
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
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Device {
        polls: u32,
        buttons: u64,
        left_x: i16,
        keys: Vec<u32>,
        passthrough_queries: u32,
        frames: u32,
    }

    impl RetroCallbacks for Device {
        fn poll_input(&mut self) {
            self.polls += 1;
        }

        fn input_state(&mut self, port: u32, device: u32, index: u32, id: u32) -> i16 {
            if port as usize >= NUM_PORTS {
                self.passthrough_queries += 1;
                return 7;
            }
            if port != 0 {
                return 0;
            }
            match device {
                DEVICE_JOYPAD => i16::from((self.buttons >> id) & 1 == 1),
                DEVICE_ANALOG if index == ANALOG_INDEX_LEFT && id == ANALOG_ID_X => self.left_x,
                DEVICE_KEYBOARD => i16::from(self.keys.contains(&id)),
                _ => 0,
            }
        }

        fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {
            self.frames += 1;
        }

        fn audio_sample(&mut self, _: i16, _: i16) {}

        fn audio_sample_batch(&mut self, samples: &[i16]) -> usize {
            samples.len() / 2
        }
    }

    fn resolved_with(port0: FrameRecord) -> [FrameRecord; NUM_PORTS] {
        [port0, FrameRecord::neutral(port0.frame_number)]
    }

    #[test]
    fn capture_reads_buttons_axes_and_keys() {
        let device = Device {
            buttons: (1 << JOYPAD_START) | (1 << JOYPAD_R3),
            left_x: -1200,
            keys: vec![13, 300],
            ..Device::default()
        };
        let mut interceptor = CallbackInterceptor::new(device, InterceptMode::Net, SpectatorFeed::Neutral);
        let record = interceptor.capture(Frame::new(9));
        assert_eq!(record.frame_number, Frame::new(9));
        assert!(record.button(JOYPAD_START));
        assert!(record.button(JOYPAD_R3));
        assert!(!record.button(JOYPAD_A));
        assert_eq!(record.analog_axis(0), -1200);
        assert!(record.key(13) && record.key(300));
        assert_eq!(interceptor.callbacks().polls, 1);
    }

    #[test]
    fn capture_does_not_repoll_after_the_simulation_polled() {
        let mut interceptor =
            CallbackInterceptor::new(Device::default(), InterceptMode::Net, SpectatorFeed::Neutral);
        interceptor.set_resolved(resolved_with(FrameRecord::neutral(Frame::ZERO)));
        interceptor.poll_input();
        let _ = interceptor.capture(Frame::ZERO);
        assert_eq!(interceptor.callbacks().polls, 1);
    }

    #[test]
    fn netplay_ports_answer_from_resolved_record() {
        let mut interceptor =
            CallbackInterceptor::new(Device::default(), InterceptMode::Net, SpectatorFeed::Neutral);
        let mut record = FrameRecord::neutral(Frame::new(2));
        record.set_button(JOYPAD_A, true);
        record.set_analog_axis(3, 500);
        record.set_key(65, true);
        interceptor.set_resolved(resolved_with(record));

        assert_eq!(interceptor.input_state(0, DEVICE_JOYPAD, 0, JOYPAD_A), 1);
        assert_eq!(interceptor.input_state(0, DEVICE_JOYPAD, 0, JOYPAD_B), 0);
        assert_eq!(
            interceptor.input_state(0, DEVICE_ANALOG, ANALOG_INDEX_RIGHT, ANALOG_ID_Y),
            500
        );
        assert_eq!(interceptor.input_state(0, DEVICE_KEYBOARD, 0, 65), 1);
        assert_eq!(interceptor.input_state(1, DEVICE_JOYPAD, 0, JOYPAD_A), 0);
        assert_eq!(interceptor.input_state(0, DEVICE_MOUSE, 0, 0), 0);
        assert_eq!(interceptor.input_state(0, DEVICE_JOYPAD, 0, 40), 0);
    }

    #[test]
    fn device_subclasses_use_their_base_type() {
        let mut interceptor =
            CallbackInterceptor::new(Device::default(), InterceptMode::Net, SpectatorFeed::Neutral);
        let mut record = FrameRecord::neutral(Frame::ZERO);
        record.set_button(JOYPAD_UP, true);
        interceptor.set_resolved(resolved_with(record));
        let subclass = (1 << 8) | DEVICE_JOYPAD;
        assert_eq!(interceptor.input_state(0, subclass, 0, JOYPAD_UP), 1);
    }

    #[test]
    fn other_ports_pass_through() {
        let mut interceptor =
            CallbackInterceptor::new(Device::default(), InterceptMode::Net, SpectatorFeed::Neutral);
        assert_eq!(interceptor.input_state(3, DEVICE_JOYPAD, 0, 0), 7);
        assert_eq!(interceptor.callbacks().passthrough_queries, 1);
    }

    #[test]
    fn spectator_sink_is_neutral_unless_replaying() {
        let mut record = FrameRecord::neutral(Frame::ZERO);
        record.set_button(JOYPAD_X, true);

        let mut neutral =
            CallbackInterceptor::new(Device::default(), InterceptMode::SpectateSink, SpectatorFeed::Neutral);
        neutral.set_resolved(resolved_with(record));
        assert_eq!(neutral.input_state(0, DEVICE_JOYPAD, 0, JOYPAD_X), 0);
        assert_eq!(neutral.input_state_spectate(0, DEVICE_JOYPAD, 0, JOYPAD_X), 0);

        let mut replay =
            CallbackInterceptor::new(Device::default(), InterceptMode::SpectateSink, SpectatorFeed::Replay);
        replay.set_resolved(resolved_with(record));
        assert_eq!(replay.input_state(0, DEVICE_JOYPAD, 0, JOYPAD_X), 1);
    }

    struct CountingTap(Arc<Mutex<(u32, usize)>>);

    impl PresentationTap for CountingTap {
        fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {
            self.0.lock().0 += 1;
        }

        fn audio_samples(&mut self, samples: &[i16]) {
            self.0.lock().1 += samples.len();
        }
    }

    #[test]
    fn tap_only_sees_output_while_active() {
        let seen = Arc::new(Mutex::new((0, 0)));
        let mut interceptor =
            CallbackInterceptor::new(Device::default(), InterceptMode::Net, SpectatorFeed::Neutral);
        interceptor.set_presentation_tap(Box::new(CountingTap(Arc::clone(&seen))));

        interceptor.video_frame(Some(&[0; 4]), 1, 1, 4);
        assert_eq!(*seen.lock(), (0, 0));

        interceptor.set_tap_active(true);
        interceptor.video_frame(None, 1, 1, 4);
        interceptor.audio_sample(1, 2);
        assert_eq!(interceptor.audio_sample_batch(&[0; 8]), 4);
        assert_eq!(*seen.lock(), (1, 10));

        let stats = interceptor.presentation_stats();
        assert_eq!(stats.video_frames, 1);
        assert_eq!(stats.duplicate_video_frames, 1);
        assert_eq!(stats.audio_frames, 5);
        assert_eq!(interceptor.callbacks().frames, 2);
    }
}
