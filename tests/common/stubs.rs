//! Callback stubs standing in for a frontend and an emulator core.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::needless_pass_by_ref_mut,
    clippy::use_self
)]

use lockstep_netplay::callbacks::{
    ANALOG_ID_X, ANALOG_INDEX_LEFT, DEVICE_ANALOG, DEVICE_JOYPAD, DEVICE_KEYBOARD,
};
use lockstep_netplay::frame_record::{JOYPAD_BUTTONS, KEY_COUNT};
use lockstep_netplay::{Frame, FrameRecord, RetroCallbacks};

/// The record a [`ScriptedPad`] with `seed` yields when captured on `frame`.
#[must_use]
pub fn scripted_record(seed: u64, frame: u64) -> FrameRecord {
    let mix = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ frame.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    let mix = mix ^ (mix >> 29);
    let mut record = FrameRecord::neutral(Frame::new(frame));
    record.button_mask = mix & ((1 << JOYPAD_BUTTONS) - 1);
    // left stick x, right stick y
    record.set_analog_axis(0, ((mix >> 16) & 0x7fff) as i16);
    record.set_analog_axis(3, -(((mix >> 32) & 0x7fff) as i16));
    record.set_key(((mix >> 48) as u32) % KEY_COUNT, true);
    record
}

/// A controller on device port 0 whose state is a pure function of `(seed, frame)`.
///
/// Tests set `frame` to the session's frame counter before each `post_frame`.
#[derive(Debug, Default)]
pub struct ScriptedPad {
    pub seed: u64,
    pub frame: u64,
    pub polls: u64,
    pub video_frames: u64,
}

impl ScriptedPad {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }
}

impl RetroCallbacks for ScriptedPad {
    fn poll_input(&mut self) {
        self.polls += 1;
    }

    fn input_state(&mut self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        if port != 0 {
            return 0;
        }
        let record = scripted_record(self.seed, self.frame);
        match device {
            DEVICE_JOYPAD => i16::from(record.button(id)),
            DEVICE_ANALOG => record.analog_axis((index * 2 + id) as usize),
            DEVICE_KEYBOARD => i16::from(record.key(id)),
            _ => 0,
        }
    }

    fn video_frame(&mut self, _data: Option<&[u8]>, _width: u32, _height: u32, _pitch: usize) {
        self.video_frames += 1;
    }

    fn audio_sample(&mut self, _left: i16, _right: i16) {}

    fn audio_sample_batch(&mut self, samples: &[i16]) -> usize {
        samples.len() / 2
    }
}

/// A deterministic "core": folds everything it reads through the callbacks into `state`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoreStub {
    pub state: u64,
    pub ticks: u64,
    /// Joypad bits seen on ports 0 and 1 during the last tick.
    pub last_masks: [u16; 2],
}

impl CoreStub {
    pub fn step<R: RetroCallbacks>(&mut self, input: &mut R) {
        input.poll_input();
        let mut masks = [0u16; 2];
        for (port, mask) in masks.iter_mut().enumerate() {
            for id in 0..JOYPAD_BUTTONS {
                if input.input_state(port as u32, DEVICE_JOYPAD, 0, id) != 0 {
                    *mask |= 1 << id;
                }
            }
        }
        let stick = input.input_state(0, DEVICE_ANALOG, ANALOG_INDEX_LEFT, ANALOG_ID_X);

        self.state = self
            .state
            .rotate_left(7)
            .wrapping_mul(0x100_0000_01B3)
            ^ (u64::from(masks[0]) | (u64::from(masks[1]) << 16) | ((stick as u16 as u64) << 32));
        self.last_masks = masks;
        self.ticks += 1;

        input.video_frame(Some(&[0u8; 4]), 1, 1, 4);
        input.audio_sample_batch(&[0i16; 8]);
    }
}
