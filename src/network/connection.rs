//! One peer's byte stream: handshake, framing, send/receive queues and ping.
//!
//! A [`Connection`] never blocks and never returns transport or codec errors
//! mid-tick. Failures move it to [`ConnectionState::Closed`], which the session
//! observes on its next poll.

pub mod state;

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};

use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::network::codec::{self, DecodeError};
use crate::network::messages::{Handshake, Message, MAGIC, PROTOCOL_VERSION};
use crate::network::network_stats::NetworkStats;
use crate::report_violation;
use crate::sessions::config::NetplayConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, NetplayError, Transport};
use state::{CloseReason, ConnectionState};

const READ_CHUNK: usize = 4096;

/// Which end of the stream we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Opened the stream; sends its handshake first and adopts the other side's delay depth.
    Initiator,
    /// Accepted the stream; answers the handshake and its delay depth is authoritative.
    Acceptor,
}

/// A framed, non-blocking message stream to one peer.
pub struct Connection {
    transport: Box<dyn Transport>,
    side: Side,
    state: ConnectionState,
    local_handshake: Handshake,
    remote_handshake: Option<Handshake>,
    delay_depth: u32,
    max_adopted_delay_depth: u32,
    handshake_timeout: Duration,
    created: Instant,
    recv_buffer: Vec<u8>,
    recv_queue: VecDeque<Message>,
    send_queue: VecDeque<Vec<u8>>,
    stats: NetworkStats,
    ping_updated: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            transport: _,
            side,
            state,
            local_handshake,
            remote_handshake,
            delay_depth,
            max_adopted_delay_depth,
            handshake_timeout,
            created,
            recv_buffer,
            recv_queue,
            send_queue,
            stats,
            ping_updated,
        } = self;

        f.debug_struct("Connection")
            .field("side", side)
            .field("state", state)
            .field("local_handshake", local_handshake)
            .field("remote_handshake", remote_handshake)
            .field("delay_depth", delay_depth)
            .field("max_adopted_delay_depth", max_adopted_delay_depth)
            .field("handshake_timeout", handshake_timeout)
            .field("created", created)
            .field("recv_buffer_len", &recv_buffer.len())
            .field("recv_queue", recv_queue)
            .field("send_queue_len", &send_queue.len())
            .field("stats", stats)
            .field("ping_updated", ping_updated)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(transport: Box<dyn Transport>, side: Side, local: Handshake, config: &NetplayConfig) -> Self {
        Self {
            transport,
            side,
            state: ConnectionState::Handshaking,
            delay_depth: local.delay_depth,
            local_handshake: local,
            remote_handshake: None,
            max_adopted_delay_depth: config.max_adopted_delay_depth,
            handshake_timeout: config.handshake_timeout,
            created: Instant::now(),
            recv_buffer: Vec::with_capacity(READ_CHUNK),
            recv_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
            stats: NetworkStats::default(),
            ping_updated: false,
        }
    }

    /// Opens the initiating end of a stream and sends our handshake right away.
    pub fn initiate(transport: Box<dyn Transport>, local: Handshake, config: &NetplayConfig) -> Self {
        let mut connection = Self::new(transport, Side::Initiator, local, config);
        let handshake = Message::Handshake(connection.local_handshake.clone());
        // A failure here closes the connection; the session sees it on its next poll.
        let _ = connection.send_unchecked(&handshake);
        connection
    }

    /// Wraps an accepted stream. Our handshake is sent once the peer's arrives.
    pub fn accept(transport: Box<dyn Transport>, local: Handshake, config: &NetplayConfig) -> Self {
        Self::new(transport, Side::Acceptor, local, config)
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// `false` once the connection is closed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.is_open()
    }

    /// The close reason, if closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match &self.state {
            ConnectionState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    /// The peer's handshake, once received.
    #[must_use]
    pub fn remote_handshake(&self) -> Option<&Handshake> {
        self.remote_handshake.as_ref()
    }

    /// The peer's nickname, or an empty string before its handshake.
    #[must_use]
    pub fn nickname(&self) -> &str {
        self.remote_handshake
            .as_ref()
            .map_or("", |hs| hs.nickname.as_str())
    }

    /// Whether the peer announced itself as a spectator.
    #[must_use]
    pub fn is_spectator(&self) -> bool {
        self.remote_handshake.as_ref().is_some_and(|hs| hs.spectate)
    }

    /// The delay depth agreed in the handshake: ours when accepting, the peer's when initiating.
    #[must_use]
    pub const fn delay_depth(&self) -> u32 {
        self.delay_depth
    }

    /// The smoothed round-trip estimate in milliseconds.
    #[must_use]
    pub fn ping_ms(&self) -> Option<u32> {
        self.stats.ping_ms
    }

    /// The newest frame any received input, combined record or sync ack carried.
    #[must_use]
    pub fn newest_frame(&self) -> Option<Frame> {
        self.stats.last_frame_acked
    }

    /// A snapshot of this connection's statistics.
    #[must_use]
    pub fn network_stats(&self) -> NetworkStats {
        NetworkStats {
            send_queue_len: self.send_queue.len(),
            ..self.stats
        }
    }

    /// Returns the new ping estimate if a pong arrived since the last call.
    pub(crate) fn take_ping_update(&mut self) -> Option<u32> {
        if std::mem::take(&mut self.ping_updated) {
            self.stats.ping_ms
        } else {
            None
        }
    }

    /// Marks the sync exchange as done. Only moves `Syncing` to `Running`.
    pub fn mark_running(&mut self) {
        if self.state == ConnectionState::Syncing {
            self.state = ConnectionState::Running;
        }
    }

    /// Encodes and queues `message`, then tries to flush.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] if the connection is (or becomes) closed.
    pub fn send(&mut self, message: &Message) -> Result<(), NetplayError> {
        if !self.is_alive() {
            return Err(NetplayError::Socket {
                context: format!("send of {} on a closed connection", message.kind()),
            });
        }
        self.send_unchecked(message)
    }

    fn send_unchecked(&mut self, message: &Message) -> Result<(), NetplayError> {
        trace!("Queuing {} to {:?}", message.kind(), self.nickname());
        let bytes = codec::encode(message)?;
        self.send_queue.push_back(bytes);
        self.stats.messages_sent += 1;
        self.flush()
    }

    /// Writes as much of the send queue as the transport accepts without blocking.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] if the transport fails; the connection is closed.
    pub fn flush(&mut self) -> Result<(), NetplayError> {
        while let Some(front) = self.send_queue.front_mut() {
            match self.transport.write(front) {
                Ok(0) => {
                    let context = "transport accepted zero bytes".to_owned();
                    self.mark_closed(CloseReason::SocketError {
                        context: context.clone(),
                    });
                    return Err(NetplayError::Socket { context });
                },
                Ok(n) if n >= front.len() => {
                    self.stats.bytes_sent += n as u64;
                    self.send_queue.pop_front();
                },
                Ok(n) => {
                    self.stats.bytes_sent += n as u64;
                    front.drain(..n);
                },
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let context = e.to_string();
                    self.mark_closed(CloseReason::SocketError {
                        context: context.clone(),
                    });
                    return Err(NetplayError::Socket { context });
                },
            }
        }
        match self.transport.flush() {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                let context = e.to_string();
                self.mark_closed(CloseReason::SocketError {
                    context: context.clone(),
                });
                Err(NetplayError::Socket { context })
            },
        }
    }

    /// Sends a ping stamped with this connection's clock.
    pub fn send_ping(&mut self) -> Result<(), NetplayError> {
        let nonce_ms = self.clock_ms();
        self.send(&Message::Ping { nonce_ms })
    }

    fn clock_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Reads everything currently available, decodes complete messages and handles
    /// handshake, ping and goodbye internally. Other messages are queued for the
    /// session, see [`peek`](Self::peek), [`pop`](Self::pop) and [`poll_recv`](Self::poll_recv).
    pub fn receive_available(&mut self) {
        if !self.is_alive() {
            return;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut end_of_stream = false;
        let mut failure: Option<io::Error> = None;
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    end_of_stream = true;
                    break;
                },
                Ok(n) => {
                    self.stats.bytes_received += n as u64;
                    self.recv_buffer.extend_from_slice(&chunk[..n]);
                },
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            }
        }

        self.decode_buffered();

        if let Some(e) = failure {
            self.mark_closed(CloseReason::SocketError {
                context: e.to_string(),
            });
        } else if end_of_stream {
            self.mark_closed(CloseReason::PeerClosed);
        }
        self.check_handshake_timeout();
        if self.is_alive() && !self.send_queue.is_empty() {
            let _ = self.flush();
        }
    }

    fn decode_buffered(&mut self) {
        let mut consumed = 0;
        while self.is_alive() {
            match codec::decode(&self.recv_buffer[consumed..]) {
                Ok((message, used)) => {
                    consumed += used;
                    self.handle_message(message);
                },
                Err(DecodeError::Truncated { .. }) => break,
                Err(DecodeError::Malformed { reason }) => {
                    warn!("Closing connection to {:?}: {}", self.nickname(), reason);
                    self.mark_closed(CloseReason::Malformed { reason });
                },
            }
        }
        self.recv_buffer.drain(..consumed);
    }

    fn handle_message(&mut self, message: Message) {
        trace!("Received {} from {:?}", message.kind(), self.nickname());
        self.stats.messages_received += 1;
        match message {
            Message::Handshake(handshake) => {
                if self.state == ConnectionState::Handshaking {
                    self.on_handshake(handshake);
                } else {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "Ignoring repeated handshake from {:?}",
                        handshake.nickname
                    );
                }
            },
            other if self.state == ConnectionState::Handshaking => {
                self.mark_closed(CloseReason::HandshakeFailed {
                    reason: format!("received {} before the handshake", other.kind()),
                });
            },
            Message::Ping { nonce_ms } => {
                let _ = self.send_unchecked(&Message::Pong { nonce_ms });
            },
            Message::Pong { nonce_ms } => {
                let rtt = self.clock_ms().saturating_sub(nonce_ms);
                self.stats.record_rtt(rtt);
                self.ping_updated = true;
            },
            Message::Goodbye => {
                debug!("{:?} said goodbye", self.nickname());
                self.mark_closed(CloseReason::PeerClosed);
            },
            other => {
                match &other {
                    Message::Input(record) => self.note_frame(record.frame_number),
                    Message::Combined { frame, .. } | Message::SyncAck { start_frame: frame } => {
                        self.note_frame(*frame);
                    },
                    _ => {},
                }
                self.recv_queue.push_back(other);
            },
        }
    }

    fn note_frame(&mut self, frame: Frame) {
        if self.stats.last_frame_acked.is_none_or(|last| frame > last) {
            self.stats.last_frame_acked = Some(frame);
        }
    }

    fn on_handshake(&mut self, remote: Handshake) {
        if remote.magic != MAGIC {
            self.mark_closed(CloseReason::HandshakeFailed {
                reason: format!("bad magic {:#010x}", remote.magic),
            });
            return;
        }
        if remote.protocol_version != PROTOCOL_VERSION {
            self.mark_closed(CloseReason::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: remote.protocol_version,
            });
            return;
        }
        match self.side {
            Side::Initiator => {
                if remote.delay_depth > self.max_adopted_delay_depth {
                    self.mark_closed(CloseReason::ProtocolMismatch {
                        local: self.max_adopted_delay_depth,
                        remote: remote.delay_depth,
                    });
                    return;
                }
                if remote.delay_depth != self.local_handshake.delay_depth {
                    debug!(
                        "Adopting host delay depth {} (requested {})",
                        remote.delay_depth, self.local_handshake.delay_depth
                    );
                }
                self.delay_depth = remote.delay_depth;
            },
            Side::Acceptor => {
                let reply = Message::Handshake(self.local_handshake.clone());
                if self.send_unchecked(&reply).is_err() {
                    return;
                }
            },
        }
        debug!(
            "Handshake with {:?} complete (spectate: {}, delay depth: {})",
            remote.nickname, remote.spectate, self.delay_depth
        );
        self.remote_handshake = Some(remote);
        self.state = ConnectionState::Syncing;
    }

    fn check_handshake_timeout(&mut self) {
        let establishing = matches!(
            self.state,
            ConnectionState::Handshaking | ConnectionState::Syncing
        );
        if establishing && self.created.elapsed() > self.handshake_timeout {
            self.mark_closed(CloseReason::HandshakeFailed {
                reason: format!("not established within {:?}", self.handshake_timeout),
            });
        }
    }

    /// The oldest queued inbound message.
    #[must_use]
    pub fn peek(&self) -> Option<&Message> {
        self.recv_queue.front()
    }

    /// Removes and returns the oldest queued inbound message.
    pub fn pop(&mut self) -> Option<Message> {
        self.recv_queue.pop_front()
    }

    /// Number of queued inbound messages.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.recv_queue.len()
    }

    /// Receives whatever is available and drains every queued inbound message.
    pub fn poll_recv(&mut self) -> Drain<'_, Message> {
        self.receive_available();
        self.recv_queue.drain(..)
    }

    fn mark_closed(&mut self, reason: CloseReason) {
        if self.state.is_open() {
            debug!("Connection to {:?} closed: {}", self.nickname(), reason);
            self.state = ConnectionState::Closed(reason);
            self.send_queue.clear();
        }
    }

    /// Sends a best-effort goodbye and closes the connection. Queued inbound messages remain.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_alive() {
            let _ = self.send_unchecked(&Message::Goodbye);
            self.mark_closed(reason);
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
    use crate::frame_record::FrameRecord;
    use crate::network::loopback::LoopbackTransport;

    fn pair(config: &NetplayConfig, host_depth: u32, client_depth: u32) -> (Connection, Connection) {
        let (a, b) = LoopbackTransport::pair();
        let client = Connection::initiate(Box::new(a), Handshake::new(client_depth, false, "client"), config);
        let host = Connection::accept(Box::new(b), Handshake::new(host_depth, false, "host"), config);
        (host, client)
    }

    fn exchange(host: &mut Connection, client: &mut Connection) {
        for _ in 0..3 {
            host.receive_available();
            client.receive_available();
        }
    }

    #[test]
    fn handshake_completes_and_client_adopts_host_depth() {
        let config = NetplayConfig::default();
        let (mut host, mut client) = pair(&config, 4, 2);
        exchange(&mut host, &mut client);
        assert_eq!(host.state(), &ConnectionState::Syncing);
        assert_eq!(client.state(), &ConnectionState::Syncing);
        assert_eq!(client.delay_depth(), 4);
        assert_eq!(host.delay_depth(), 4);
        assert_eq!(host.nickname(), "client");
        assert_eq!(client.nickname(), "host");
    }

    #[test]
    fn host_deeper_than_client_accepts_is_protocol_mismatch() {
        let config = NetplayConfig {
            max_adopted_delay_depth: 3,
            ..NetplayConfig::default()
        };
        let (mut host, mut client) = pair(&config, 6, 2);
        exchange(&mut host, &mut client);
        assert_eq!(
            client.close_reason(),
            Some(&CloseReason::ProtocolMismatch { local: 3, remote: 6 })
        );
    }

    #[test]
    fn version_mismatch_closes_with_protocol_mismatch() {
        let config = NetplayConfig::default();
        let (a, b) = LoopbackTransport::pair();
        let mut stale = Handshake::new(2, false, "old");
        stale.protocol_version = PROTOCOL_VERSION + 1;
        let _client = Connection::initiate(Box::new(a), stale, &config);
        let mut host = Connection::accept(Box::new(b), Handshake::new(2, false, "host"), &config);
        host.receive_available();
        assert_eq!(
            host.close_reason(),
            Some(&CloseReason::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: PROTOCOL_VERSION + 1
            })
        );
    }

    #[test]
    fn bad_magic_is_handshake_failure() {
        let config = NetplayConfig::default();
        let (a, b) = LoopbackTransport::pair();
        let mut bogus = Handshake::new(2, false, "bogus");
        bogus.magic = 0xDEAD_BEEF;
        let _client = Connection::initiate(Box::new(a), bogus, &config);
        let mut host = Connection::accept(Box::new(b), Handshake::new(2, false, "host"), &config);
        host.receive_available();
        assert!(matches!(
            host.close_reason(),
            Some(CloseReason::HandshakeFailed { .. })
        ));
    }

    #[test]
    fn data_before_handshake_is_handshake_failure() {
        let config = NetplayConfig::default();
        let (mut a, b) = LoopbackTransport::pair();
        let bytes = codec::encode(&Message::Input(FrameRecord::neutral(Frame::ZERO))).unwrap();
        io::Write::write_all(&mut a, &bytes).unwrap();
        let mut host = Connection::accept(Box::new(b), Handshake::new(2, false, "host"), &config);
        host.receive_available();
        assert!(matches!(
            host.close_reason(),
            Some(CloseReason::HandshakeFailed { .. })
        ));
    }

    #[test]
    fn malformed_bytes_close_the_connection() {
        let config = NetplayConfig::default();
        let (mut a, b) = LoopbackTransport::pair();
        io::Write::write_all(&mut a, &[0, 0, 0, 0]).unwrap();
        let mut host = Connection::accept(Box::new(b), Handshake::new(2, false, "host"), &config);
        host.receive_available();
        assert!(matches!(host.close_reason(), Some(CloseReason::Malformed { .. })));
    }

    #[test]
    fn chunked_delivery_reassembles_messages() {
        let config = NetplayConfig::default();
        let (a, b) = LoopbackTransport::pair();
        let (a, b) = (a.with_max_chunk(3), b.with_max_chunk(5));
        let mut client = Connection::initiate(Box::new(a), Handshake::new(1, false, "c"), &config);
        let mut host = Connection::accept(Box::new(b), Handshake::new(1, false, "h"), &config);
        host.receive_available();
        assert_eq!(host.state(), &ConnectionState::Handshaking);
        for _ in 0..64 {
            host.receive_available();
            client.receive_available();
        }
        assert_eq!(host.state(), &ConnectionState::Syncing);
        assert_eq!(client.state(), &ConnectionState::Syncing);

        let mut record = FrameRecord::neutral(Frame::new(7));
        record.set_button(2, true);
        client.send(&Message::Input(record)).unwrap();
        for _ in 0..64 {
            client.flush().unwrap();
            host.receive_available();
        }
        assert_eq!(host.pop(), Some(Message::Input(record)));
        assert_eq!(host.network_stats().last_frame_acked, Some(Frame::new(7)));
    }

    #[test]
    fn goodbye_closes_but_keeps_queued_messages() {
        let config = NetplayConfig::default();
        let (mut host, mut client) = pair(&config, 2, 2);
        exchange(&mut host, &mut client);
        client.send(&Message::Sync { start_frame: Frame::ZERO }).unwrap();
        client.close(CloseReason::LocalClose);
        host.receive_available();
        assert_eq!(host.close_reason(), Some(&CloseReason::PeerClosed));
        assert_eq!(host.pending_messages(), 1);
        assert!(host.send(&Message::Goodbye).is_err());
    }

    #[test]
    fn ping_pong_updates_estimate() {
        let config = NetplayConfig::default();
        let (mut host, mut client) = pair(&config, 2, 2);
        exchange(&mut host, &mut client);
        client.send_ping().unwrap();
        exchange(&mut host, &mut client);
        assert!(client.ping_ms().is_some());
        assert!(client.take_ping_update().is_some());
        assert!(client.take_ping_update().is_none());
    }

    #[test]
    fn eof_closes_as_peer_closed() {
        let config = NetplayConfig::default();
        let (mut host, mut client) = pair(&config, 2, 2);
        exchange(&mut host, &mut client);
        drop(client);
        host.receive_available();
        assert_eq!(host.close_reason(), Some(&CloseReason::PeerClosed));
    }

    #[test]
    fn handshake_timeout_closes() {
        let config = NetplayConfig {
            handshake_timeout: Duration::from_millis(1),
            ..NetplayConfig::default()
        };
        let (_a, b) = LoopbackTransport::pair();
        let mut host = Connection::accept(Box::new(b), Handshake::new(2, false, "host"), &config);
        std::thread::sleep(Duration::from_millis(5));
        host.receive_available();
        assert!(matches!(
            host.close_reason(),
            Some(CloseReason::HandshakeFailed { .. })
        ));
    }
}
