use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::NetplayEvent;

/// A zero-allocation opaque iterator that drains events from a session.
///
/// This type wraps the internal event queue drain, providing a stable public API
/// that doesn't expose `std::collections::vec_deque::Drain` directly. It implements
/// [`Iterator`], [`DoubleEndedIterator`], [`ExactSizeIterator`], and [`FusedIterator`].
///
/// Obtain an `EventDrain` by calling [`NetplaySession::events()`].
///
/// # Examples
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         NetplayEvent::ConnectionStalled { frame, .. } => {
///             println!("waiting on frame {frame}");
///         }
///         other => println!("{}", other.status_text()),
///     }
/// }
/// ```
///
/// [`NetplaySession::events()`]: crate::NetplaySession::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, NetplayEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, NetplayEvent>) -> Self {
        Self { inner: drain }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = NetplayEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::iter_with_drain
)]
mod tests {
    use super::*;
    use crate::Frame;
    use std::collections::VecDeque;

    fn make_event(frame: u64) -> NetplayEvent {
        NetplayEvent::Degraded {
            frame: Frame::new(frame),
        }
    }

    fn queue_of(frames: &[u64]) -> VecDeque<NetplayEvent> {
        frames.iter().copied().map(make_event).collect()
    }

    #[test]
    fn drain_yields_all_events_in_order() {
        let mut queue = queue_of(&[1, 2, 3]);
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events, vec![make_event(1), make_event(2), make_event(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_is_fused() {
        let mut queue = queue_of(&[1]);
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert!(drain.next().is_some());
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }

    #[test]
    fn double_ended_iteration() {
        let mut queue = queue_of(&[1, 2, 3]);
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.next_back(), Some(make_event(3)));
        assert_eq!(drain.next(), Some(make_event(1)));
        assert_eq!(drain.next_back(), Some(make_event(2)));
        assert!(drain.next().is_none());
    }

    #[test]
    fn exact_size_is_accurate() {
        let mut queue = queue_of(&[1, 2]);
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 2);
        assert_eq!(drain.size_hint(), (2, Some(2)));
        let _ = drain.next();
        assert_eq!(drain.len(), 1);
    }

    #[test]
    fn debug_format_shows_remaining_count() {
        let mut queue = queue_of(&[1, 2]);
        let drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(format!("{drain:?}"), "EventDrain { remaining: 2 }");
    }
}
