//! The per-port, per-frame input snapshot exchanged between peers.

use serde::{Deserialize, Serialize};

use crate::Frame;

/// Number of 32-bit words holding the keyboard bitmap.
pub const KEY_WORDS: usize = 10;

/// Number of keyboard key codes a record can represent.
pub const KEY_COUNT: u32 = (KEY_WORDS as u32) * 32;

/// Number of joypad buttons captured into [`FrameRecord::button_mask`].
pub const JOYPAD_BUTTONS: u32 = 16;

/// Number of analog axes: left stick X/Y, right stick X/Y.
pub const ANALOG_AXES: usize = 4;

/// Size in bytes of a bincode-encoded [`FrameRecord`].
pub const FRAME_RECORD_WIRE_SIZE: usize = 8 + 8 + 2 * ANALOG_AXES + 4 * KEY_WORDS;

/// One port's complete input for one frame.
///
/// Records are plain values: they are copied into the delay buffer, onto the wire
/// and into the interceptor's resolved set. A record whose fields are all zero is
/// *neutral* ("no input").
///
/// ```
/// use lockstep_netplay::{Frame, FrameRecord};
///
/// let mut record = FrameRecord::neutral(Frame::new(3));
/// assert!(record.is_neutral());
/// record.set_button(8, true);
/// record.set_key(97, true);
/// assert!(record.button(8));
/// assert!(record.key(97));
/// assert!(!record.key(98));
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRecord {
    /// The frame during which this input was captured.
    pub frame_number: Frame,
    /// One bit per joypad button id.
    pub button_mask: u64,
    /// Analog axes, indexed `stick * 2 + axis`.
    pub analog: [i16; ANALOG_AXES],
    /// Keyboard bitmap, one bit per key code.
    pub key_bits: [u32; KEY_WORDS],
}

impl FrameRecord {
    /// A record with no buttons, keys or stick deflection.
    #[must_use]
    pub const fn neutral(frame_number: Frame) -> Self {
        Self {
            frame_number,
            button_mask: 0,
            analog: [0; ANALOG_AXES],
            key_bits: [0; KEY_WORDS],
        }
    }

    /// Returns `true` if no input is held.
    #[must_use]
    pub fn is_neutral(&self) -> bool {
        self.button_mask == 0
            && self.analog.iter().all(|a| *a == 0)
            && self.key_bits.iter().all(|w| *w == 0)
    }

    /// The same input stamped with another frame.
    #[must_use]
    pub const fn with_frame(mut self, frame_number: Frame) -> Self {
        self.frame_number = frame_number;
        self
    }

    /// Whether joypad button `id` is held. Ids past 63 are never held.
    #[must_use]
    pub const fn button(&self, id: u32) -> bool {
        id < 64 && (self.button_mask >> id) & 1 == 1
    }

    /// Sets or clears joypad button `id`. Ids past 63 are ignored.
    pub fn set_button(&mut self, id: u32, held: bool) {
        if id >= 64 {
            return;
        }
        if held {
            self.button_mask |= 1 << id;
        } else {
            self.button_mask &= !(1 << id);
        }
    }

    /// Value of analog axis `axis`, or 0 if out of range.
    #[must_use]
    pub fn analog_axis(&self, axis: usize) -> i16 {
        self.analog.get(axis).copied().unwrap_or(0)
    }

    /// Sets analog axis `axis`. Out of range axes are ignored.
    pub fn set_analog_axis(&mut self, axis: usize, value: i16) {
        if let Some(slot) = self.analog.get_mut(axis) {
            *slot = value;
        }
    }

    /// Whether keyboard key `code` is held. Codes past [`KEY_COUNT`] are never held.
    #[must_use]
    pub fn key(&self, code: u32) -> bool {
        self.key_bits
            .get((code / 32) as usize)
            .is_some_and(|word| (word >> (code % 32)) & 1 == 1)
    }

    /// Sets or clears keyboard key `code`. Codes past [`KEY_COUNT`] are ignored.
    pub fn set_key(&mut self, code: u32, held: bool) {
        if let Some(word) = self.key_bits.get_mut((code / 32) as usize) {
            let bit = 1u32 << (code % 32);
            if held {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
    }
}

impl Default for FrameRecord {
    fn default() -> Self {
        Self::neutral(Frame::ZERO)
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
    fn buttons_set_and_clear() {
        let mut record = FrameRecord::neutral(Frame::ZERO);
        record.set_button(0, true);
        record.set_button(15, true);
        assert_eq!(record.button_mask, 0x8001);
        record.set_button(0, false);
        assert!(!record.button(0));
        assert!(record.button(15));
        record.set_button(200, true);
        assert!(!record.button(200));
    }

    #[test]
    fn keys_span_all_words() {
        let mut record = FrameRecord::neutral(Frame::ZERO);
        record.set_key(0, true);
        record.set_key(KEY_COUNT - 1, true);
        assert_eq!(record.key_bits[0], 1);
        assert_eq!(record.key_bits[KEY_WORDS - 1], 1 << 31);
        record.set_key(KEY_COUNT, true);
        assert!(!record.key(KEY_COUNT));
    }

    #[test]
    fn analog_out_of_range_is_zero() {
        let mut record = FrameRecord::neutral(Frame::ZERO);
        record.set_analog_axis(3, -1200);
        record.set_analog_axis(9, 5);
        assert_eq!(record.analog_axis(3), -1200);
        assert_eq!(record.analog_axis(9), 0);
        assert!(!record.is_neutral());
    }

    #[test]
    fn with_frame_keeps_input() {
        let mut record = FrameRecord::neutral(Frame::new(1));
        record.set_button(4, true);
        let moved = record.with_frame(Frame::new(9));
        assert_eq!(moved.frame_number, Frame::new(9));
        assert_eq!(moved.button_mask, record.button_mask);
    }
}
