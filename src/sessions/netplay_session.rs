use crate::callbacks::{CallbackInterceptor, InterceptMode, RetroCallbacks};
use crate::delay_buffer::DelayBuffer;
use crate::error::NetplayResult;
use crate::frame_record::FrameRecord;
use crate::network::connection::state::{CloseReason, ConnectionState};
use crate::network::connection::Connection;
use crate::network::messages::{Handshake, Message};
use crate::network::network_stats::NetworkStats;
use crate::report_violation_to;
use crate::sessions::config::{NetplayConfig, StallPolicy};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::port_assignment::PortAssignment;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    Frame, InvalidRequestKind, NetplayError, NetplayEvent, Port, PortDriver, SessionRole,
    SessionState, StreamAcceptor, Transport, NUM_PORTS,
};
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};
use web_time::Instant;

use std::collections::VecDeque;
use std::sync::Arc;

const P0: Port = Port::new(0);
const P1: Port = Port::new(1);

/// How a session reaches its peers.
pub(crate) enum Link {
    /// Host roles: poll this for incoming streams.
    Listen(Box<dyn StreamAcceptor>),
    /// Client roles: the stream to the host.
    Connect(Box<dyn Transport>),
}

struct Spectator {
    connection: Connection,
    /// First frame whose combined record this spectator receives.
    start_frame: Frame,
}

/// A [`NetplaySession`] keeps one simulation in lockstep with a remote one.
///
/// The simulation loop calls [`pre_frame`] before and [`post_frame`] after every
/// tick. Between the two, the simulation runs against [`interceptor_mut`], which
/// answers input queries from the records resolved in `pre_frame`. Create
/// sessions with [`SessionBuilder`](crate::SessionBuilder) or
/// [`netplay_new`](crate::netplay_new).
///
/// [`pre_frame`]: Self::pre_frame
/// [`post_frame`]: Self::post_frame
/// [`interceptor_mut`]: Self::interceptor_mut
pub struct NetplaySession<C>
where
    C: RetroCallbacks,
{
    role: SessionRole,
    /// Internal State of the Session.
    state: SessionState,
    config: NetplayConfig,
    /// Sent to every accepted stream.
    local_handshake: Handshake,
    /// The agreed delay depth: ours when hosting, the host's once adopted.
    delay_depth: u32,
    /// The tick the next `pre_frame` resolves.
    frame_counter: Frame,
    /// First frame this session simulates (0, or the join frame of a spectator).
    start_frame: Frame,
    /// Records by port and frame: capture frames for players, tick frames for spectator sinks.
    buffer: DelayBuffer,
    assignment: PortAssignment,

    /// Incoming streams, host roles only.
    acceptor: Option<Box<dyn StreamAcceptor>>,
    /// Accepted streams whose handshake is not complete yet.
    pending: Vec<Connection>,
    /// The primary peer: the client of a host, the host of a client or spectator sink.
    peer: Option<Connection>,
    peer_nickname: Option<String>,
    spectators: Vec<Spectator>,

    /// Local captures not yet in the buffer because their port is behind.
    pending_local: VecDeque<FrameRecord>,
    /// What the interceptor answers from during the current (or last) tick.
    applied: Option<[FrameRecord; NUM_PORTS]>,
    /// Newest capture frame applied so far.
    last_consumed: Option<Frame>,
    tick_open: bool,
    /// Why the session closed, reported once by the next `pre_frame`.
    failure: Option<NetplayError>,

    interceptor: CallbackInterceptor<C>,
    /// Contains all events to be forwarded to the user.
    event_queue: VecDeque<NetplayEvent>,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<C: RetroCallbacks> std::fmt::Debug for NetplaySession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            role,
            state,
            config,
            local_handshake,
            delay_depth,
            frame_counter,
            start_frame,
            buffer,
            assignment,
            acceptor,
            pending,
            peer,
            peer_nickname,
            spectators,
            pending_local,
            applied,
            last_consumed,
            tick_open,
            failure,
            interceptor,
            event_queue,
            violation_observer,
        } = self;

        f.debug_struct("NetplaySession")
            .field("role", role)
            .field("state", state)
            .field("config", config)
            .field("local_handshake", local_handshake)
            .field("delay_depth", delay_depth)
            .field("frame_counter", frame_counter)
            .field("start_frame", start_frame)
            .field("buffer", buffer)
            .field("assignment", assignment)
            .field("listening", &acceptor.is_some())
            .field("pending", pending)
            .field("peer", peer)
            .field("peer_nickname", peer_nickname)
            .field("num_spectators", &spectators.len())
            .field("pending_local", pending_local)
            .field("applied", applied)
            .field("last_consumed", last_consumed)
            .field("tick_open", tick_open)
            .field("failure", failure)
            .field("interceptor", interceptor)
            .field("event_queue", event_queue)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl<C: RetroCallbacks> NetplaySession<C> {
    pub(crate) fn new(
        role: SessionRole,
        config: NetplayConfig,
        nickname: String,
        callbacks: C,
        link: Link,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let spectate = matches!(
            role,
            SessionRole::SpectatorSource | SessionRole::SpectatorSink
        );
        let local_handshake = Handshake::new(config.delay_depth, spectate, nickname);

        let (assignment, mode) = match role {
            SessionRole::Host => (PortAssignment::split(P0), InterceptMode::Net),
            SessionRole::Client => (PortAssignment::split(P1), InterceptMode::Net),
            SessionRole::SpectatorSource => {
                (PortAssignment::all_local(), InterceptMode::SpectateSource)
            },
            SessionRole::SpectatorSink => (PortAssignment::all_remote(), InterceptMode::SpectateSink),
        };

        let (acceptor, peer) = match link {
            Link::Listen(acceptor) => (Some(acceptor), None),
            Link::Connect(transport) => (
                None,
                Some(Connection::initiate(
                    transport,
                    local_handshake.clone(),
                    &config,
                )),
            ),
        };

        // a spectator source has nobody to wait for
        let state = if role == SessionRole::SpectatorSource {
            SessionState::Running
        } else {
            SessionState::Handshaking
        };

        info!(
            "Starting {:?} session as {:?} with delay depth {}",
            role, local_handshake.nickname, config.delay_depth
        );

        Self {
            role,
            state,
            delay_depth: config.delay_depth,
            buffer: DelayBuffer::new(NUM_PORTS, config.delay_depth, Frame::ZERO),
            config,
            local_handshake,
            frame_counter: Frame::ZERO,
            start_frame: Frame::ZERO,
            assignment,
            acceptor,
            pending: Vec::new(),
            peer,
            peer_nickname: None,
            spectators: Vec::new(),
            pending_local: VecDeque::new(),
            applied: None,
            last_consumed: None,
            tick_open: false,
            failure: None,
            interceptor: CallbackInterceptor::new(callbacks, mode, config.spectator_feed),
            event_queue: VecDeque::new(),
            violation_observer,
        }
    }

    /// Resolves the input for the current tick and installs it in the interceptor.
    ///
    /// Call this before every simulation tick; run the tick only if it returns `Ok`.
    /// Waits up to the configured stall timeout for late remote input.
    ///
    /// # Errors
    /// - [`NotSynchronized`] while the handshake is in progress. Skip the tick.
    /// - [`ConnectionStalled`] if remote input is late and the stall policy is
    ///   [`StallPolicy::Wait`]. Skip the tick and retry.
    /// - [`HandshakeFailed`] or [`ProtocolMismatch`] once, when a client could not connect.
    /// - [`FrameOutOfOrder`] or [`Desync`] if the peers disagree; the session is closed.
    /// - [`SessionClosed`] after the session was closed.
    /// - [`InvalidRequest`] if the previous `pre_frame` was not followed by `post_frame`.
    ///
    /// [`NotSynchronized`]: NetplayError::NotSynchronized
    /// [`ConnectionStalled`]: NetplayError::ConnectionStalled
    /// [`HandshakeFailed`]: NetplayError::HandshakeFailed
    /// [`ProtocolMismatch`]: NetplayError::ProtocolMismatch
    /// [`FrameOutOfOrder`]: NetplayError::FrameOutOfOrder
    /// [`Desync`]: NetplayError::Desync
    /// [`SessionClosed`]: NetplayError::SessionClosed
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn pre_frame(&mut self) -> NetplayResult<()> {
        if self.state == SessionState::Closed {
            return Err(self.failure.take().unwrap_or(NetplayError::SessionClosed));
        }
        if self.tick_open {
            return Err(InvalidRequestKind::CallOrder { call: "pre_frame" }.into());
        }

        self.poll_network();

        match self.state {
            SessionState::Closed => {
                return Err(self.failure.take().unwrap_or(NetplayError::SessionClosed));
            },
            SessionState::Handshaking | SessionState::Syncing => {
                return Err(NetplayError::NotSynchronized);
            },
            SessionState::Running | SessionState::Flipping { .. } | SessionState::Degraded => {},
        }

        let records = match self.resolve() {
            Ok(records) => records,
            Err(e) => return Err(self.fail_if_fatal(e)),
        };

        trace!("Frame {} applies {:?}", self.frame_counter, records);
        self.applied = Some(records);
        self.interceptor.set_resolved(records);
        self.interceptor
            .set_tap_active(self.role.is_host() && !self.spectators.is_empty());
        self.tick_open = true;
        Ok(())
    }

    /// Captures and distributes the local input of the tick that just ran, then
    /// advances the frame counter.
    ///
    /// # Errors
    /// - [`InvalidRequest`] if `pre_frame` did not open a tick.
    /// - [`FrameOutOfOrder`] or [`Desync`] if the peers disagree; the session is closed.
    /// - [`SessionClosed`] after the session was closed.
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    /// [`FrameOutOfOrder`]: NetplayError::FrameOutOfOrder
    /// [`Desync`]: NetplayError::Desync
    /// [`SessionClosed`]: NetplayError::SessionClosed
    pub fn post_frame(&mut self) -> NetplayResult<()> {
        if self.state == SessionState::Closed {
            return Err(NetplayError::SessionClosed);
        }
        if !self.tick_open {
            return Err(InvalidRequestKind::CallOrder { call: "post_frame" }.into());
        }
        self.tick_open = false;
        let frame = self.frame_counter;

        match self.role {
            SessionRole::Host | SessionRole::Client => {
                let record = self.interceptor.capture(frame);
                self.pending_local.push_back(record);
                if let Err(e) = self.settle() {
                    return Err(self.fail_if_fatal(e));
                }
                if let Some(peer) = self.peer.as_mut().filter(|peer| peer.is_alive()) {
                    if let Err(e) = peer.send(&Message::Input(record)) {
                        debug!("Input for frame {} not sent: {}", frame, e);
                    }
                }
            },
            SessionRole::SpectatorSource => {
                for port in Port::all() {
                    let record = self.interceptor.capture_port(port.as_usize() as u32, frame);
                    if let Err(e) = self.buffer.push(port, frame, record) {
                        return Err(self.fail_if_fatal(e));
                    }
                }
            },
            SessionRole::SpectatorSink => {},
        }

        // new spectators accepted here still receive this frame
        self.poll_network();
        if self.role.is_host() {
            self.send_combined(frame);
        }

        let since_start = frame.as_u64().saturating_sub(self.start_frame.as_u64());
        if since_start % u64::from(self.config.ping_interval_frames) == 0 {
            if let Some(peer) = self.peer.as_mut().filter(|peer| peer.is_alive()) {
                let _ = peer.send_ping();
            }
        }

        self.flush_all();
        self.frame_counter = frame.next();
        Ok(())
    }

    /// Swaps which port the local and the remote user drive, starting with the
    /// input captured on the next tick.
    ///
    /// The flip is announced to the peer, which applies it at the same frame.
    /// Until the peer acknowledges, the session is in [`SessionState::Flipping`].
    ///
    /// # Errors
    /// - [`InvalidRequest`] for spectator roles, during a tick, or unless the
    ///   session is [`SessionState::Running`].
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn flip_users(&mut self) -> NetplayResult<()> {
        if !matches!(self.role, SessionRole::Host | SessionRole::Client) {
            return Err(InvalidRequestKind::FlipNotAllowed {
                reason: "spectator sessions have no user to flip",
            }
            .into());
        }
        if self.tick_open {
            return Err(InvalidRequestKind::FlipNotAllowed {
                reason: "flip between post_frame and pre_frame",
            }
            .into());
        }
        if self.state != SessionState::Running {
            return Err(InvalidRequestKind::FlipNotAllowed {
                reason: "the session is not running with a peer",
            }
            .into());
        }

        let effective_frame = self.frame_counter;
        self.assignment.schedule_flip(effective_frame)?;
        if let Err(e) = self.buffer.swap_ports_from(P0, P1, effective_frame) {
            return Err(self.fail_if_fatal(e));
        }
        if let Some(peer) = self.peer.as_mut() {
            if let Err(e) = peer.send(&Message::Flip { effective_frame }) {
                debug!("Flip announcement not sent: {}", e);
            }
        }
        info!("Flipping users at frame {}", effective_frame);
        self.state = SessionState::Flipping { effective_frame };
        self.push_event(NetplayEvent::UsersFlipped { effective_frame });
        Ok(())
    }

    /// Gives the session a chance to accept connections, finish handshakes and
    /// serve spectators outside of `pre_frame`/`post_frame`, e.g. while waiting for
    /// a peer to connect.
    pub fn poll_remote_clients(&mut self) {
        self.poll_network();
        self.flush_all();
    }

    /// Says goodbye to every peer and closes the session.
    pub fn free(&mut self) {
        if self.state != SessionState::Closed {
            info!("Closing netplay session at frame {}", self.frame_counter);
        }
        self.close_all(CloseReason::LocalClose);
        self.pending.clear();
        self.spectators.clear();
        self.tick_open = false;
        self.state = SessionState::Closed;
    }

    /// The role fixed at creation.
    #[must_use]
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// The current state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the next (or the currently open) tick simulates.
    #[must_use]
    pub fn frame_counter(&self) -> Frame {
        self.frame_counter
    }

    /// The agreed delay depth.
    #[must_use]
    pub fn delay_depth(&self) -> u32 {
        self.delay_depth
    }

    /// The configuration the session was built with.
    #[must_use]
    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    /// Who drives `port` for input captured on the current frame.
    ///
    /// # Errors
    /// - [`InvalidRequest`] if `port` is not a netplay port.
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn port_driver(&self, port: Port) -> NetplayResult<PortDriver> {
        self.port_driver_at(port, self.frame_counter)
    }

    /// Who drives `port` for input captured on `frame`.
    ///
    /// # Errors
    /// - [`InvalidRequest`] if `port` is not a netplay port.
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn port_driver_at(&self, port: Port, frame: Frame) -> NetplayResult<PortDriver> {
        if !port.is_valid() {
            return Err(InvalidRequestKind::InvalidPort { port }.into());
        }
        Ok(self.assignment.driver(port, frame))
    }

    /// The port local input captured on the current frame is written to.
    /// `None` for spectator roles.
    #[must_use]
    pub fn local_port(&self) -> Option<Port> {
        self.assignment.local_port(self.frame_counter)
    }

    /// The buffered record of `port` for `frame`, if still held.
    ///
    /// Players key records by capture frame; spectator sinks by simulated frame.
    #[must_use]
    pub fn record_at(&self, port: Port, frame: Frame) -> Option<FrameRecord> {
        self.buffer.get(port, frame)
    }

    /// The records applied on the current (or, between ticks, the last) tick.
    #[must_use]
    pub fn applied_inputs(&self) -> Option<[FrameRecord; NUM_PORTS]> {
        self.applied
    }

    /// For spectator sinks: the host's combined records for the current tick.
    #[must_use]
    pub fn spectated_inputs(&self) -> Option<[FrameRecord; NUM_PORTS]> {
        if self.role == SessionRole::SpectatorSink {
            self.applied
        } else {
            None
        }
    }

    /// Spectators currently served.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.spectators.len()
    }

    /// The primary peer's nickname once its handshake arrived.
    #[must_use]
    pub fn peer_nickname(&self) -> Option<&str> {
        self.peer_nickname.as_deref()
    }

    /// Statistics of the primary peer connection, `None` without one.
    #[must_use]
    pub fn network_stats(&self) -> Option<NetworkStats> {
        let peer = self.peer.as_ref()?;
        let mut stats = peer.network_stats();
        stats.remote_frames_ahead = stats.last_frame_acked.map_or(0, |frame| {
            frame.as_u64() as i64 - self.frame_counter.as_u64() as i64
        });
        Some(stats)
    }

    /// Returns all events that happened since last queried for events. If the number of
    /// stored events exceeds the configured `event_queue_size`, the oldest events are discarded.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// The interceptor wrapping the frontend's callbacks.
    #[must_use]
    pub fn interceptor(&self) -> &CallbackInterceptor<C> {
        &self.interceptor
    }

    /// The interceptor to run the simulation tick against.
    #[must_use]
    pub fn interceptor_mut(&mut self) -> &mut CallbackInterceptor<C> {
        &mut self.interceptor
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    // #############
    // #  NETWORK  #
    // #############

    fn poll_network(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.accept_incoming();
        self.poll_pending();
        if let Some(peer) = self.peer.as_mut() {
            peer.receive_available();
        }
        self.advance_peer_lifecycle();
        self.poll_spectators();
        if let Some(ping_ms) = self.peer.as_mut().and_then(Connection::take_ping_update) {
            self.push_event(NetplayEvent::PingUpdated { ping_ms });
        }
    }

    fn accept_incoming(&mut self) {
        let Some(acceptor) = self.acceptor.as_mut() else {
            return;
        };
        loop {
            match acceptor.accept_stream() {
                Ok(Some(transport)) => {
                    debug!("Accepted a new stream, waiting for its handshake");
                    self.pending.push(Connection::accept(
                        transport,
                        self.local_handshake.clone(),
                        &self.config,
                    ));
                },
                Ok(None) => break,
                Err(e) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Transport,
                        "Accepting a connection failed: {}",
                        e
                    );
                    break;
                },
            }
        }
    }

    fn poll_pending(&mut self) {
        let mut index = 0;
        while index < self.pending.len() {
            self.pending[index].receive_available();
            let state = self.pending[index].state().clone();
            match state {
                ConnectionState::Handshaking => index += 1,
                ConnectionState::Closed(reason) => {
                    debug!("Dropping connection before its handshake completed: {}", reason);
                    self.pending.swap_remove(index);
                },
                ConnectionState::Syncing | ConnectionState::Running => {
                    let connection = self.pending.swap_remove(index);
                    self.admit(connection);
                },
            }
        }
    }

    /// Decides what a connection with a completed handshake becomes.
    fn admit(&mut self, mut connection: Connection) {
        let nickname = connection.nickname().to_owned();

        if connection.is_spectator() {
            if self.spectators.len() >= self.config.max_spectators {
                info!(
                    "Rejecting spectator {:?}: all {} slots are taken",
                    nickname, self.config.max_spectators
                );
                connection.close(CloseReason::Rejected);
                return;
            }
            let start_frame = self.frame_counter;
            if connection.send(&Message::Sync { start_frame }).is_err() {
                return;
            }
            connection.mark_running();
            info!("{:?} is spectating from frame {}", nickname, start_frame);
            self.spectators.push(Spectator {
                connection,
                start_frame,
            });
            self.push_event(NetplayEvent::SpectatorJoined {
                nickname,
                start_frame,
            });
            return;
        }

        let wants_player = self.role == SessionRole::Host
            && self.peer.is_none()
            && self.state == SessionState::Handshaking;
        if !wants_player {
            info!("Rejecting player {:?}: no free player slot", nickname);
            connection.close(CloseReason::Rejected);
            return;
        }
        if connection
            .send(&Message::Sync {
                start_frame: self.start_frame,
            })
            .is_err()
        {
            return;
        }
        info!("{:?} connected, synchronizing", nickname);
        self.peer = Some(connection);
        self.peer_nickname = Some(nickname.clone());
        self.state = SessionState::Syncing;
        self.push_event(NetplayEvent::PeerConnected {
            nickname,
            spectate: false,
        });
    }

    fn advance_peer_lifecycle(&mut self) {
        let Some(peer_state) = self.peer.as_ref().map(|peer| peer.state().clone()) else {
            return;
        };

        if self.state == SessionState::Handshaking && !self.role.is_host() {
            match peer_state {
                ConnectionState::Handshaking => return,
                ConnectionState::Closed(reason) => {
                    self.on_establishment_lost(reason);
                    return;
                },
                ConnectionState::Syncing | ConnectionState::Running => self.on_host_handshake(),
            }
        }

        match self.state {
            SessionState::Syncing => self.advance_sync(),
            SessionState::Running | SessionState::Flipping { .. } => {
                let gone = self
                    .peer
                    .as_ref()
                    .is_some_and(|peer| !peer.is_alive() && peer.pending_messages() == 0);
                if gone {
                    self.degrade();
                }
            },
            SessionState::Handshaking | SessionState::Degraded | SessionState::Closed => {},
        }
    }

    /// Client roles: the host answered our handshake.
    fn on_host_handshake(&mut self) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        let depth = peer.delay_depth();
        let nickname = peer.nickname().to_owned();
        let spectate = peer.is_spectator();

        if depth != self.delay_depth {
            info!(
                "Using the host's delay depth {} instead of {}",
                depth, self.delay_depth
            );
        }
        self.delay_depth = depth;
        self.buffer = DelayBuffer::new(NUM_PORTS, depth, self.start_frame);
        self.peer_nickname = Some(nickname.clone());
        self.state = SessionState::Syncing;
        self.push_event(NetplayEvent::PeerConnected { nickname, spectate });
    }

    fn advance_sync(&mut self) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if !peer.is_alive() && peer.pending_messages() == 0 {
            let reason = peer
                .close_reason()
                .cloned()
                .unwrap_or(CloseReason::PeerClosed);
            self.on_establishment_lost(reason);
            return;
        }

        let Some(front) = peer.peek().cloned() else {
            return;
        };
        match front {
            Message::SyncAck { start_frame } if self.role.is_host() && start_frame == self.start_frame => {
                self.pop_peer();
                if let Some(peer) = self.peer.as_mut() {
                    peer.mark_running();
                }
                info!("Synchronized with {:?}", self.peer_nickname);
                self.state = SessionState::Running;
                self.push_event(NetplayEvent::Synchronized { start_frame });
            },
            Message::Sync { start_frame } if !self.role.is_host() => {
                self.pop_peer();
                self.start_frame = start_frame;
                self.frame_counter = start_frame;
                self.buffer = DelayBuffer::new(NUM_PORTS, self.delay_depth, start_frame);
                if let Some(peer) = self.peer.as_mut() {
                    if peer.send(&Message::SyncAck { start_frame }).is_err() {
                        return;
                    }
                    peer.mark_running();
                }
                info!("Synchronized, starting at frame {}", start_frame);
                self.state = SessionState::Running;
                self.push_event(NetplayEvent::Synchronized { start_frame });
            },
            other => {
                self.pop_peer();
                self.note_unexpected(&other);
            },
        }
    }

    /// The primary peer went away before the session started running.
    fn on_establishment_lost(&mut self, reason: CloseReason) {
        let nickname = self
            .peer
            .take()
            .map(|peer| peer.nickname().to_owned())
            .unwrap_or_default();
        self.push_event(NetplayEvent::PeerDisconnected {
            nickname,
            reason: reason.clone(),
        });

        if self.role.is_host() {
            info!("Player left before the match started ({}), waiting again", reason);
            self.peer_nickname = None;
            self.state = SessionState::Handshaking;
            return;
        }

        warn!("Could not connect to the host: {}", reason);
        self.failure = Some(match reason {
            CloseReason::ProtocolMismatch { local, remote } => {
                NetplayError::ProtocolMismatch { local, remote }
            },
            CloseReason::HandshakeFailed { reason } => NetplayError::HandshakeFailed { reason },
            other => NetplayError::HandshakeFailed {
                reason: other.to_string(),
            },
        });
        self.close_all(CloseReason::LocalClose);
        self.state = SessionState::Closed;
    }

    fn poll_spectators(&mut self) {
        let mut gone: SmallVec<[usize; 4]> = SmallVec::new();
        for (index, spectator) in self.spectators.iter_mut().enumerate() {
            let mut ignored_inputs = 0usize;
            for message in spectator.connection.poll_recv() {
                match message {
                    Message::Input(_) => ignored_inputs += 1,
                    other => trace!("Spectator sent {}", other.kind()),
                }
            }
            if ignored_inputs > 0 {
                debug!(
                    "Ignoring {} input records from spectator {:?}",
                    ignored_inputs,
                    spectator.connection.nickname()
                );
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "Spectator {:?} sent {} input records",
                    spectator.connection.nickname(),
                    ignored_inputs
                );
            }
            if !spectator.connection.is_alive() {
                gone.push(index);
            }
        }

        for index in gone.into_iter().rev() {
            let spectator = self.spectators.remove(index);
            let reason = spectator
                .connection
                .close_reason()
                .cloned()
                .unwrap_or(CloseReason::PeerClosed);
            info!(
                "Spectator {:?} left: {}",
                spectator.connection.nickname(),
                reason
            );
            self.push_event(NetplayEvent::SpectatorLeft {
                nickname: spectator.connection.nickname().to_owned(),
                reason,
            });
        }
    }

    fn send_combined(&mut self, frame: Frame) {
        let Some(ports) = self.applied else {
            return;
        };
        let message = Message::Combined { frame, ports };
        for spectator in &mut self.spectators {
            if spectator.start_frame > frame || !spectator.connection.is_alive() {
                continue;
            }
            if let Err(e) = spectator.connection.send(&message) {
                debug!(
                    "Combined record for frame {} not sent to {:?}: {}",
                    frame,
                    spectator.connection.nickname(),
                    e
                );
            }
        }
    }

    fn flush_all(&mut self) {
        let connections = self
            .peer
            .iter_mut()
            .chain(self.pending.iter_mut())
            .chain(self.spectators.iter_mut().map(|s| &mut s.connection));
        for connection in connections {
            if connection.is_alive() {
                let _ = connection.flush();
            }
        }
    }

    fn close_all(&mut self, reason: CloseReason) {
        let connections = self
            .peer
            .iter_mut()
            .chain(self.pending.iter_mut())
            .chain(self.spectators.iter_mut().map(|s| &mut s.connection));
        for connection in connections {
            connection.close(reason.clone());
        }
    }

    fn pop_peer(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.pop();
        }
    }

    fn note_unexpected(&self, message: &Message) {
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "Ignoring unexpected {} from {:?} while {:?}",
            message.kind(),
            self.peer_nickname,
            self.state
        );
    }

    // #############
    // # LOCKSTEP  #
    // #############

    /// Resolves the records applied on the current tick, waiting for remote input if needed.
    fn resolve(&mut self) -> NetplayResult<[FrameRecord; NUM_PORTS]> {
        let target = if self.role == SessionRole::SpectatorSink {
            Some(self.frame_counter)
        } else {
            self.frame_counter
                .checked_sub(u64::from(self.delay_depth))
                .filter(|target| *target >= self.start_frame)
        };
        let Some(target) = target else {
            return Ok([FrameRecord::neutral(self.frame_counter); NUM_PORTS]);
        };

        if self.role == SessionRole::SpectatorSource {
            self.last_consumed = Some(target);
            return Ok(self.lookup(target).unwrap_or_else(|| {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "Local capture for frame {} is missing",
                    target
                );
                [FrameRecord::neutral(target); NUM_PORTS]
            }));
        }

        let started = Instant::now();
        loop {
            self.settle()?;
            if let Some(records) = self.lookup(target) {
                self.last_consumed = Some(target);
                return Ok(records);
            }
            if self.state == SessionState::Degraded {
                self.last_consumed = Some(target);
                return Ok([P0, P1].map(|port| {
                    self.buffer
                        .get(port, target)
                        .unwrap_or(FrameRecord::neutral(target))
                }));
            }
            if !self.peer.as_ref().is_some_and(Connection::is_alive) {
                self.degrade();
                continue;
            }

            let waited = started.elapsed();
            if waited >= self.config.stall_timeout {
                let waited_ms = waited.as_millis();
                warn!(
                    "No remote input for frame {} after {} ms (policy {:?})",
                    target, waited_ms, self.config.stall_policy
                );
                self.push_event(NetplayEvent::ConnectionStalled {
                    frame: target,
                    waited_ms,
                });
                match self.config.stall_policy {
                    StallPolicy::Wait => {
                        return Err(NetplayError::ConnectionStalled {
                            frame: target,
                            waited_ms,
                        });
                    },
                    StallPolicy::DropPeer => {
                        if let Some(peer) = self.peer.as_mut() {
                            peer.close(CloseReason::Stalled);
                        }
                        self.degrade();
                        continue;
                    },
                }
            }

            std::thread::sleep(self.config.stall_poll_interval);
            if let Some(peer) = self.peer.as_mut() {
                peer.receive_available();
            }
        }
    }

    fn lookup(&self, frame: Frame) -> Option<[FrameRecord; NUM_PORTS]> {
        Some([self.buffer.get(P0, frame)?, self.buffer.get(P1, frame)?])
    }

    /// Moves everything that fits into the buffer: pending local captures and the
    /// peer's queued messages, in stream order.
    fn settle(&mut self) -> NetplayResult<()> {
        self.check_peer_horizon()?;
        loop {
            let pushed = self.push_pending_locals()?;
            let drained = self.drain_peer_message()?;
            if !pushed && !drained {
                return Ok(());
            }
        }
    }

    /// A player never runs more than `delay_depth` ticks ahead of us, so its
    /// captures stay at or below `frame_counter + delay_depth`. Records past that
    /// would wait in the peer's queue forever.
    fn check_peer_horizon(&self) -> NetplayResult<()> {
        if !matches!(self.role, SessionRole::Host | SessionRole::Client) {
            return Ok(());
        }
        let horizon = self.frame_counter + u64::from(self.delay_depth);
        match self.peer.as_ref().and_then(Connection::newest_frame) {
            Some(frame) if frame > horizon => Err(NetplayError::Desync {
                frame,
                reason: format!("peer sent input for frame {frame}, past frame {horizon}"),
            }),
            _ => Ok(()),
        }
    }

    fn push_pending_locals(&mut self) -> NetplayResult<bool> {
        let mut progressed = false;
        while let Some(record) = self.pending_local.front().copied() {
            let frame = record.frame_number;
            let Some(port) = self.assignment.local_port(frame) else {
                self.pending_local.pop_front();
                continue;
            };
            if self.buffer.next_expected(port) < frame {
                if self.state != SessionState::Degraded {
                    break;
                }
                // the remote records this port was waiting for will never arrive
                self.buffer.reset_port(port, frame)?;
            }
            self.buffer.push(port, frame, record)?;
            self.pending_local.pop_front();
            progressed = true;
        }
        Ok(progressed)
    }

    fn drain_peer_message(&mut self) -> NetplayResult<bool> {
        let Some(front) = self.peer.as_ref().and_then(Connection::peek).cloned() else {
            return Ok(false);
        };

        match front {
            Message::Input(record) if self.role != SessionRole::SpectatorSink => {
                let frame = record.frame_number;
                if frame > self.frame_counter {
                    return Ok(false);
                }
                let Some(port) = self.assignment.remote_port(frame) else {
                    self.pop_peer();
                    return Ok(true);
                };
                if self.buffer.next_expected(port) < frame {
                    return Ok(false);
                }
                self.buffer.push(port, frame, record)?;
                trace!("Remote input for frame {} stored on port {}", frame, port);
            },
            Message::Combined { frame, ports } if self.role == SessionRole::SpectatorSink => {
                if frame > self.frame_counter {
                    return Ok(false);
                }
                for (port, record) in Port::all().zip(ports) {
                    self.buffer.push(port, frame, record)?;
                }
            },
            Message::Flip { effective_frame }
                if matches!(self.role, SessionRole::Host | SessionRole::Client) =>
            {
                self.on_remote_flip(effective_frame)?;
            },
            Message::FlipAck { effective_frame } => self.on_flip_ack(effective_frame)?,
            other => self.note_unexpected(&other),
        }
        self.pop_peer();
        Ok(true)
    }

    fn on_remote_flip(&mut self, effective_frame: Frame) -> NetplayResult<()> {
        if let SessionState::Flipping {
            effective_frame: ours,
        } = self.state
        {
            return Err(NetplayError::Desync {
                frame: effective_frame,
                reason: format!(
                    "both sides flipped users (here at frame {}, remotely at frame {})",
                    ours, effective_frame
                ),
            });
        }
        if let Some(consumed) = self.last_consumed.filter(|c| *c >= effective_frame) {
            return Err(NetplayError::Desync {
                frame: effective_frame,
                reason: format!(
                    "flip at frame {} arrived after frame {} was applied",
                    effective_frame, consumed
                ),
            });
        }
        self.assignment
            .schedule_flip(effective_frame)
            .map_err(|e| NetplayError::Desync {
                frame: effective_frame,
                reason: e.to_string(),
            })?;
        self.buffer.swap_ports_from(P0, P1, effective_frame)?;
        if let Some(peer) = self.peer.as_mut() {
            if let Err(e) = peer.send(&Message::FlipAck { effective_frame }) {
                debug!("Flip acknowledgement not sent: {}", e);
            }
        }
        info!("Peer flipped users at frame {}", effective_frame);
        self.push_event(NetplayEvent::UsersFlipped { effective_frame });
        Ok(())
    }

    fn on_flip_ack(&mut self, acked: Frame) -> NetplayResult<()> {
        match self.state {
            SessionState::Flipping { effective_frame } if effective_frame == acked => {
                debug!("Flip at frame {} acknowledged", acked);
                self.state = SessionState::Running;
                Ok(())
            },
            SessionState::Flipping { effective_frame } => Err(NetplayError::Desync {
                frame: acked,
                reason: format!(
                    "flip requested at frame {} but acknowledged for frame {}",
                    effective_frame, acked
                ),
            }),
            _ => Err(NetplayError::Desync {
                frame: acked,
                reason: format!("unsolicited flip acknowledgement for frame {}", acked),
            }),
        }
    }

    /// Continues without the primary peer.
    fn degrade(&mut self) {
        let reason = self
            .peer
            .take()
            .and_then(|peer| peer.close_reason().cloned())
            .unwrap_or(CloseReason::LocalClose);
        let nickname = self.peer_nickname.clone().unwrap_or_default();
        warn!(
            "Lost {:?} at frame {} ({}), continuing locally",
            nickname, self.frame_counter, reason
        );
        self.state = SessionState::Degraded;
        self.push_event(NetplayEvent::PeerDisconnected { nickname, reason });
        self.push_event(NetplayEvent::Degraded {
            frame: self.frame_counter,
        });
    }

    /// Closes the session on errors after which the peers can no longer agree.
    fn fail_if_fatal(&mut self, err: NetplayError) -> NetplayError {
        let frame = match &err {
            NetplayError::FrameOutOfOrder { got, .. } => *got,
            NetplayError::Desync { frame, .. } => *frame,
            _ => return err,
        };
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Critical,
            ViolationKind::FrameSync,
            "Closing session at frame {}: {}",
            self.frame_counter,
            err
        );
        self.push_event(NetplayEvent::DesyncDetected {
            frame,
            reason: err.to_string(),
        });
        self.close_all(CloseReason::LocalClose);
        self.tick_open = false;
        self.state = SessionState::Closed;
        err
    }

    fn push_event(&mut self, event: NetplayEvent) {
        self.event_queue.push_back(event);
        // check event queue size and discard oldest events if too big
        while self.event_queue.len() > self.config.event_queue_size {
            self.event_queue.pop_front();
        }
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
    use crate::callbacks::{DEVICE_JOYPAD, JOYPAD_A};
    use crate::network::loopback;
    use crate::SessionBuilder;

    /// Holds A on device port `port` during even frames.
    #[derive(Default)]
    struct Blinker {
        frame: u64,
    }

    impl RetroCallbacks for Blinker {
        fn poll_input(&mut self) {}

        fn input_state(&mut self, _port: u32, device: u32, _index: u32, id: u32) -> i16 {
            i16::from(device == DEVICE_JOYPAD && id == JOYPAD_A && self.frame % 2 == 0)
        }

        fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {}

        fn audio_sample(&mut self, _: i16, _: i16) {}

        fn audio_sample_batch(&mut self, samples: &[i16]) -> usize {
            samples.len() / 2
        }
    }

    fn source(delay: u32) -> NetplaySession<Blinker> {
        let (acceptor, _connector) = loopback::listener();
        SessionBuilder::new()
            .with_delay_depth(delay)
            .unwrap()
            .start_spectator_source(Blinker::default(), acceptor)
            .unwrap()
    }

    fn tick(session: &mut NetplaySession<Blinker>) -> [FrameRecord; NUM_PORTS] {
        session.pre_frame().unwrap();
        let applied = session.applied_inputs().unwrap();
        let frame = session.frame_counter().as_u64();
        session.interceptor_mut().callbacks_mut().frame = frame;
        session.post_frame().unwrap();
        applied
    }

    #[test]
    fn host_waits_for_a_player() {
        let (acceptor, _connector) = loopback::listener();
        let mut host = SessionBuilder::new()
            .start_host(Blinker::default(), acceptor)
            .unwrap();
        assert_eq!(host.current_state(), SessionState::Handshaking);
        assert_eq!(host.pre_frame(), Err(NetplayError::NotSynchronized));
        assert!(host.post_frame().is_err());
        assert_eq!(host.local_port(), Some(P0));
    }

    #[test]
    fn spectator_source_runs_immediately() {
        let session = source(2);
        assert_eq!(session.current_state(), SessionState::Running);
        assert_eq!(session.local_port(), None);
        assert_eq!(session.port_driver(P1), Ok(PortDriver::Local));
    }

    #[test]
    fn source_applies_captures_after_the_delay() {
        let mut session = source(2);
        let mut applied = Vec::new();
        for _ in 0..6 {
            applied.push(tick(&mut session));
        }
        // neutral prefill for the first two ticks
        assert!(applied[0].iter().all(FrameRecord::is_neutral));
        assert!(applied[1].iter().all(FrameRecord::is_neutral));
        assert_eq!(applied[1][0].frame_number, Frame::new(1));
        // tick f applies the capture of f - 2, A held on even capture frames
        for f in 2..6 {
            assert_eq!(applied[f][0].frame_number, Frame::new(f as u64 - 2));
            assert_eq!(applied[f][0].button(JOYPAD_A), f % 2 == 0);
            assert_eq!(applied[f][0], applied[f][1]);
        }
    }

    #[test]
    fn calls_must_alternate() {
        let mut session = source(1);
        session.pre_frame().unwrap();
        assert!(matches!(
            session.pre_frame(),
            Err(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::CallOrder { call: "pre_frame" }
            })
        ));
        session.post_frame().unwrap();
        assert!(matches!(
            session.post_frame(),
            Err(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::CallOrder { call: "post_frame" }
            })
        ));
    }

    #[test]
    fn flips_need_a_running_player_session() {
        let mut session = source(1);
        assert!(matches!(
            session.flip_users(),
            Err(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::FlipNotAllowed { .. }
            })
        ));
        let (acceptor, _connector) = loopback::listener();
        let mut host = SessionBuilder::new()
            .start_host(Blinker::default(), acceptor)
            .unwrap();
        assert!(host.flip_users().is_err());
    }

    #[test]
    fn free_closes_the_session() {
        let mut session = source(1);
        session.free();
        assert_eq!(session.current_state(), SessionState::Closed);
        assert_eq!(session.pre_frame(), Err(NetplayError::SessionClosed));
        assert_eq!(session.post_frame(), Err(NetplayError::SessionClosed));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let session = source(1);
        assert!(session.port_driver(Port::new(2)).is_err());
        assert_eq!(session.record_at(Port::new(5), Frame::ZERO), None);
    }

    #[test]
    fn event_queue_is_bounded() {
        let (acceptor, _connector) = loopback::listener();
        let config = NetplayConfig {
            event_queue_size: 2,
            ..NetplayConfig::default()
        };
        let mut host = SessionBuilder::new()
            .with_config(config)
            .unwrap()
            .start_host(Blinker::default(), acceptor)
            .unwrap();
        for frame in 0..5 {
            host.push_event(NetplayEvent::Degraded {
                frame: Frame::new(frame),
            });
        }
        let events: Vec<_> = host.events().collect();
        assert_eq!(
            events,
            vec![
                NetplayEvent::Degraded {
                    frame: Frame::new(3)
                },
                NetplayEvent::Degraded {
                    frame: Frame::new(4)
                },
            ]
        );
    }
}
