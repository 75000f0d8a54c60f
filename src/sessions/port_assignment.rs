//! Which port the local user drives, per capture frame.
//!
//! A host drives port 0 and its client port 1 until the users are flipped. A
//! flip takes effect at a frame `E`: everything captured at or after `E` is
//! written to the other port. Flips are kept as a schedule rather than a single
//! current port, because records captured before `E` are still being applied
//! for `delay_depth` ticks after the flip was requested.

use crate::{Frame, InvalidRequestKind, NetplayError, Port, PortDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// One local port, one remote port.
    Split { base_local: Port },
    /// Every port is driven locally (spectator source).
    AllLocal,
    /// Every port comes from the network (spectator sink).
    AllRemote,
}

/// Maps capture frames to the local and remote ports.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and fuzzing.
/// It is not part of the stable public API.
///
/// ```
/// use lockstep_netplay::{Frame, Port, PortAssignment};
///
/// let mut assignment = PortAssignment::split(Port::new(0));
/// assignment.schedule_flip(Frame::new(6))?;
/// assert_eq!(assignment.local_port(Frame::new(5)), Some(Port::new(0)));
/// assert_eq!(assignment.local_port(Frame::new(6)), Some(Port::new(1)));
/// assert_eq!(assignment.remote_port(Frame::new(6)), Some(Port::new(0)));
/// # Ok::<(), lockstep_netplay::NetplayError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    layout: Layout,
    flips: Vec<Frame>,
}

impl PortAssignment {
    /// One local and one remote port; `base_local` is local until the first flip.
    #[must_use]
    pub fn split(base_local: Port) -> Self {
        Self {
            layout: Layout::Split { base_local },
            flips: Vec::new(),
        }
    }

    /// Every port is local.
    #[must_use]
    pub fn all_local() -> Self {
        Self {
            layout: Layout::AllLocal,
            flips: Vec::new(),
        }
    }

    /// Every port is remote.
    #[must_use]
    pub fn all_remote() -> Self {
        Self {
            layout: Layout::AllRemote,
            flips: Vec::new(),
        }
    }

    fn flips_at(&self, frame: Frame) -> usize {
        self.flips.iter().filter(|e| **e <= frame).count()
    }

    /// The port the local user's input captured at `frame` belongs to.
    /// `None` unless the layout is split.
    #[must_use]
    pub fn local_port(&self, frame: Frame) -> Option<Port> {
        match self.layout {
            Layout::Split { base_local } => Some(if self.flips_at(frame) % 2 == 1 {
                base_local.other()
            } else {
                base_local
            }),
            Layout::AllLocal | Layout::AllRemote => None,
        }
    }

    /// The port the peer's input captured at `frame` belongs to.
    #[must_use]
    pub fn remote_port(&self, frame: Frame) -> Option<Port> {
        self.local_port(frame).map(Port::other)
    }

    /// Who supplies `port`'s input captured at `frame`.
    #[must_use]
    pub fn driver(&self, port: Port, frame: Frame) -> PortDriver {
        match self.layout {
            Layout::AllLocal => PortDriver::Local,
            Layout::AllRemote => PortDriver::Remote,
            Layout::Split { .. } => {
                if self.local_port(frame) == Some(port) {
                    PortDriver::Local
                } else {
                    PortDriver::Remote
                }
            },
        }
    }

    /// Swaps the ports for every frame `>= effective_frame`.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::FlipNotAllowed`] for spectator layouts or when
    /// `effective_frame` is not after the last scheduled flip.
    pub fn schedule_flip(&mut self, effective_frame: Frame) -> Result<(), NetplayError> {
        if !matches!(self.layout, Layout::Split { .. }) {
            return Err(InvalidRequestKind::FlipNotAllowed {
                reason: "spectator sessions have no user to flip",
            }
            .into());
        }
        if self.flips.last().is_some_and(|last| *last >= effective_frame) {
            return Err(InvalidRequestKind::FlipNotAllowed {
                reason: "a flip is already scheduled at or after this frame",
            }
            .into());
        }
        self.flips.push(effective_frame);
        Ok(())
    }

    /// Effective frames of all flips so far, oldest first.
    #[must_use]
    pub fn flips(&self) -> &[Frame] {
        &self.flips
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

    #[test]
    fn host_and_client_are_mirrored() {
        let host = PortAssignment::split(P0);
        let client = PortAssignment::split(P1);
        for f in 0..10 {
            let frame = Frame::new(f);
            assert_eq!(host.local_port(frame), client.remote_port(frame));
            assert_eq!(host.remote_port(frame), client.local_port(frame));
        }
    }

    #[test]
    fn flips_alternate() {
        let mut assignment = PortAssignment::split(P0);
        assignment.schedule_flip(Frame::new(6)).unwrap();
        assignment.schedule_flip(Frame::new(10)).unwrap();
        assert_eq!(assignment.local_port(Frame::new(5)), Some(P0));
        assert_eq!(assignment.local_port(Frame::new(6)), Some(P1));
        assert_eq!(assignment.local_port(Frame::new(9)), Some(P1));
        assert_eq!(assignment.local_port(Frame::new(10)), Some(P0));
        assert_eq!(assignment.driver(P1, Frame::new(7)), PortDriver::Local);
        assert_eq!(assignment.driver(P0, Frame::new(7)), PortDriver::Remote);
        assert_eq!(assignment.flips(), &[Frame::new(6), Frame::new(10)]);
    }

    #[test]
    fn flips_must_move_forward() {
        let mut assignment = PortAssignment::split(P1);
        assignment.schedule_flip(Frame::new(4)).unwrap();
        assert!(assignment.schedule_flip(Frame::new(4)).is_err());
        assert!(assignment.schedule_flip(Frame::new(3)).is_err());
    }

    #[test]
    fn spectator_layouts() {
        let mut source = PortAssignment::all_local();
        let sink = PortAssignment::all_remote();
        for port in Port::all() {
            assert_eq!(source.driver(port, Frame::ZERO), PortDriver::Local);
            assert_eq!(sink.driver(port, Frame::ZERO), PortDriver::Remote);
        }
        assert_eq!(source.local_port(Frame::ZERO), None);
        assert_eq!(sink.remote_port(Frame::ZERO), None);
        assert!(source.schedule_flip(Frame::new(1)).is_err());
    }
}
