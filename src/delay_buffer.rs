use crate::frame_record::FrameRecord;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, InvalidRequestKind, NetplayError, Port};

#[derive(Debug, Clone, Copy)]
struct Slot {
    frame: Frame,
    record: FrameRecord,
}

#[derive(Debug, Clone)]
struct PortRing {
    slots: Vec<Option<Slot>>,
    /// The only frame `push` accepts next.
    next_expected: Frame,
    /// Frame the port (re)started at; nothing below it was pushed since.
    base: Frame,
}

impl PortRing {
    fn newest(&self) -> Option<Frame> {
        if self.next_expected > self.base {
            self.next_expected.checked_sub(1)
        } else {
            None
        }
    }
}

/// Per-port ring of the most recent `delay_depth + 1` frame records.
///
/// Records must be pushed for consecutive frames, starting at the buffer's start
/// frame. The record for frame `f` lives in slot `f mod capacity` and stays
/// readable until the port receives frame `f + capacity`.
///
/// # Note
///
/// This type is re-exported at the crate root for property tests and benches.
/// Sessions own their buffer; user code normally only reads it through
/// [`NetplaySession::record_at`](crate::NetplaySession::record_at).
#[derive(Debug, Clone)]
pub struct DelayBuffer {
    ports: Vec<PortRing>,
    delay_depth: u32,
}

impl DelayBuffer {
    /// Creates a buffer for `num_ports` ports whose first expected frame is `start_frame`.
    #[must_use]
    pub fn new(num_ports: usize, delay_depth: u32, start_frame: Frame) -> Self {
        let capacity = delay_depth as usize + 1;
        let ring = PortRing {
            slots: vec![None; capacity],
            next_expected: start_frame,
            base: start_frame,
        };
        Self {
            ports: vec![ring; num_ports],
            delay_depth,
        }
    }

    /// Number of records held per port.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.delay_depth as usize + 1
    }

    /// The delay depth this buffer was sized for.
    #[must_use]
    pub const fn delay_depth(&self) -> u32 {
        self.delay_depth
    }

    /// Number of ports.
    #[must_use]
    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    fn slot_index(&self, frame: Frame) -> usize {
        (frame.as_u64() % self.capacity() as u64) as usize
    }

    fn ring(&self, port: Port) -> Result<&PortRing, NetplayError> {
        self.ports
            .get(port.as_usize())
            .ok_or(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::InvalidPort { port },
            })
    }

    fn ring_mut(&mut self, port: Port) -> Result<&mut PortRing, NetplayError> {
        self.ports
            .get_mut(port.as_usize())
            .ok_or(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::InvalidPort { port },
            })
    }

    /// Stores `record` as `port`'s input for `frame`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::FrameOutOfOrder`] unless `frame` is exactly
    /// [`next_expected`](Self::next_expected); the buffer is left untouched.
    pub fn push(&mut self, port: Port, frame: Frame, record: FrameRecord) -> Result<(), NetplayError> {
        let index = self.slot_index(frame);
        let ring = self.ring_mut(port)?;
        if frame != ring.next_expected {
            return Err(NetplayError::FrameOutOfOrder {
                port,
                expected: ring.next_expected,
                got: frame,
            });
        }
        ring.slots[index] = Some(Slot { frame, record });
        ring.next_expected = frame.next();
        Ok(())
    }

    /// Returns `port`'s record for `frame`.
    ///
    /// `None` if the record has not arrived yet, or if it has already been evicted
    /// by newer records. Reading an evicted frame is reported as a critical
    /// violation: a correct session never looks that far back.
    #[must_use]
    pub fn get(&self, port: Port, frame: Frame) -> Option<FrameRecord> {
        let Ok(ring) = self.ring(port) else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::DelayBuffer,
                "get for port {} of a {}-port buffer",
                port,
                self.ports.len()
            );
            return None;
        };
        if frame >= ring.next_expected {
            return None;
        }
        if let Some(newest) = ring.newest() {
            if frame + self.capacity() as u64 <= newest {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::DelayBuffer,
                    "read of evicted frame {} on port {} (newest {}, capacity {})",
                    frame,
                    port,
                    newest,
                    self.capacity()
                );
                return None;
            }
        }
        ring.slots[self.slot_index(frame)]
            .filter(|slot| slot.frame == frame)
            .map(|slot| slot.record)
    }

    /// The frame `push` will accept next for `port`.
    #[must_use]
    pub fn next_expected(&self, port: Port) -> Frame {
        self.ring(port)
            .map_or(Frame::ZERO, |ring| ring.next_expected)
    }

    /// The most recent frame pushed for `port`, if any.
    #[must_use]
    pub fn newest(&self, port: Port) -> Option<Frame> {
        self.ring(port).ok().and_then(PortRing::newest)
    }

    /// Exchanges the records for frames `>= from` between ports `a` and `b`.
    ///
    /// Records below `from` stay where they are. Afterwards each port expects the
    /// frame the other port expected, unless the other port held nothing at or after
    /// `from`, in which case it expects `from` (or less, if it was behind).
    ///
    /// # Errors
    ///
    /// [`NetplayError::Desync`] if the swap would leave a gap: one port holds
    /// records at or after `from` while the other is still missing records before it.
    pub fn swap_ports_from(&mut self, a: Port, b: Port, from: Frame) -> Result<(), NetplayError> {
        let next_a = self.ring(a)?.next_expected;
        let next_b = self.ring(b)?.next_expected;
        if a == b {
            return Ok(());
        }
        if (next_a > from && next_b < from) || (next_b > from && next_a < from) {
            return Err(NetplayError::Desync {
                frame: from,
                reason: format!(
                    "cannot swap ports {} and {} at frame {}: they expect frames {} and {}",
                    a, b, from, next_a, next_b
                ),
            });
        }

        let (lo, hi) = if a.as_usize() < b.as_usize() {
            (a.as_usize(), b.as_usize())
        } else {
            (b.as_usize(), a.as_usize())
        };
        let (head, tail) = self.ports.split_at_mut(hi);
        let (first, second) = (&mut head[lo], &mut tail[0]);

        for (slot_a, slot_b) in first.slots.iter_mut().zip(second.slots.iter_mut()) {
            let moves_a = slot_a.is_some_and(|s| s.frame >= from);
            let moves_b = slot_b.is_some_and(|s| s.frame >= from);
            match (moves_a, moves_b) {
                (true, true) => std::mem::swap(slot_a, slot_b),
                (true, false) => *slot_b = slot_a.take(),
                (false, true) => *slot_a = slot_b.take(),
                (false, false) => {},
            }
        }

        let next_first = first.next_expected;
        let next_second = second.next_expected;
        first.next_expected = if next_second > from {
            next_second
        } else {
            next_first.min(from)
        };
        second.next_expected = if next_first > from {
            next_first
        } else {
            next_second.min(from)
        };
        Ok(())
    }

    /// Makes `port` expect `next` as its next frame, as if it had just been created there.
    ///
    /// Records already held below `next` remain readable.
    pub fn reset_port(&mut self, port: Port, next: Frame) -> Result<(), NetplayError> {
        let ring = self.ring_mut(port)?;
        ring.next_expected = next;
        ring.base = next;
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

    const P0: Port = Port::new(0);
    const P1: Port = Port::new(1);

    fn rec(frame: u64, buttons: u64) -> FrameRecord {
        let mut record = FrameRecord::neutral(Frame::new(frame));
        record.button_mask = buttons;
        record
    }

    fn fill(buffer: &mut DelayBuffer, port: Port, frames: std::ops::Range<u64>, tag: u64) {
        for f in frames {
            buffer.push(port, Frame::new(f), rec(f, tag + f)).unwrap();
        }
    }

    #[test]
    fn get_before_arrival_is_none() {
        let buffer = DelayBuffer::new(2, 3, Frame::ZERO);
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(buffer.get(P0, Frame::ZERO), None);
        assert_eq!(buffer.newest(P0), None);
    }

    #[test]
    fn push_then_get_within_window() {
        let mut buffer = DelayBuffer::new(2, 3, Frame::ZERO);
        fill(&mut buffer, P0, 0..4, 100);
        for f in 0..4 {
            assert_eq!(buffer.get(P0, Frame::new(f)).unwrap().button_mask, 100 + f);
        }
        assert_eq!(buffer.get(P1, Frame::ZERO), None);
        assert_eq!(buffer.newest(P0), Some(Frame::new(3)));
    }

    #[test]
    fn oldest_record_is_evicted_by_capacity_push() {
        let mut buffer = DelayBuffer::new(1, 2, Frame::ZERO);
        fill(&mut buffer, P0, 0..4, 0);
        assert_eq!(buffer.get(P0, Frame::ZERO), None);
        assert!(buffer.get(P0, Frame::new(1)).is_some());
    }

    #[test]
    fn out_of_order_push_does_not_overwrite() {
        let mut buffer = DelayBuffer::new(1, 3, Frame::ZERO);
        fill(&mut buffer, P0, 0..2, 10);
        let err = buffer.push(P0, Frame::new(5), rec(5, 0)).unwrap_err();
        assert_eq!(
            err,
            NetplayError::FrameOutOfOrder {
                port: P0,
                expected: Frame::new(2),
                got: Frame::new(5)
            }
        );
        let err = buffer.push(P0, Frame::new(1), rec(1, 0)).unwrap_err();
        assert!(matches!(err, NetplayError::FrameOutOfOrder { .. }));
        assert_eq!(buffer.get(P0, Frame::new(1)).unwrap().button_mask, 11);
        assert_eq!(buffer.next_expected(P0), Frame::new(2));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut buffer = DelayBuffer::new(2, 1, Frame::ZERO);
        let err = buffer.push(Port::new(2), Frame::ZERO, rec(0, 0)).unwrap_err();
        assert!(matches!(
            err,
            NetplayError::InvalidRequest {
                kind: InvalidRequestKind::InvalidPort { .. }
            }
        ));
        assert_eq!(buffer.get(Port::new(2), Frame::ZERO), None);
    }

    #[test]
    fn late_start_frame() {
        let mut buffer = DelayBuffer::new(2, 3, Frame::new(50));
        assert!(buffer.push(P0, Frame::ZERO, rec(0, 0)).is_err());
        buffer.push(P0, Frame::new(50), rec(50, 1)).unwrap();
        assert_eq!(buffer.get(P0, Frame::new(50)).unwrap().button_mask, 1);
        assert_eq!(buffer.get(P0, Frame::new(46)), None);
    }

    #[test]
    fn swap_moves_only_later_frames() {
        let mut buffer = DelayBuffer::new(2, 3, Frame::ZERO);
        // Port 0 expects 6; port 1 already holds 6..=8.
        fill(&mut buffer, P0, 0..6, 100);
        fill(&mut buffer, P1, 0..9, 200);
        buffer.swap_ports_from(P0, P1, Frame::new(6)).unwrap();

        assert_eq!(buffer.next_expected(P0), Frame::new(9));
        assert_eq!(buffer.next_expected(P1), Frame::new(6));
        for f in 6..9 {
            assert_eq!(buffer.get(P0, Frame::new(f)).unwrap().button_mask, 200 + f);
            assert_eq!(buffer.get(P1, Frame::new(f)), None);
        }
        assert_eq!(buffer.get(P1, Frame::new(5)).unwrap().button_mask, 205);
        buffer.push(P1, Frame::new(6), rec(6, 0)).unwrap();
    }

    #[test]
    fn swap_with_nothing_after_is_noop() {
        let mut buffer = DelayBuffer::new(2, 3, Frame::ZERO);
        fill(&mut buffer, P0, 0..6, 100);
        fill(&mut buffer, P1, 0..4, 200);
        buffer.swap_ports_from(P1, P0, Frame::new(6)).unwrap();
        assert_eq!(buffer.next_expected(P0), Frame::new(6));
        assert_eq!(buffer.next_expected(P1), Frame::new(4));
        assert_eq!(buffer.get(P0, Frame::new(5)).unwrap().button_mask, 105);
    }

    #[test]
    fn swap_that_would_leave_a_gap_is_desync() {
        let mut buffer = DelayBuffer::new(2, 3, Frame::ZERO);
        fill(&mut buffer, P0, 0..8, 0);
        fill(&mut buffer, P1, 0..4, 0);
        let err = buffer.swap_ports_from(P0, P1, Frame::new(6)).unwrap_err();
        assert!(matches!(err, NetplayError::Desync { .. }));
        assert_eq!(buffer.next_expected(P0), Frame::new(8));
    }

    #[test]
    fn reset_port_skips_ahead() {
        let mut buffer = DelayBuffer::new(2, 3, Frame::ZERO);
        fill(&mut buffer, P1, 0..3, 0);
        buffer.reset_port(P1, Frame::new(7)).unwrap();
        assert_eq!(buffer.newest(P1), None);
        assert_eq!(buffer.get(P1, Frame::new(2)).unwrap().button_mask, 2);
        buffer.push(P1, Frame::new(7), rec(7, 0)).unwrap();
        assert_eq!(buffer.get(P1, Frame::new(5)), None);
    }
}
