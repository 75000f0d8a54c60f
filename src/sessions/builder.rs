use std::sync::Arc;

use tracing::info;
use web_time::Duration;

use crate::callbacks::RetroCallbacks;
use crate::network::messages::MAX_NICKNAME_LEN;
use crate::network::tcp_stream::{TcpAcceptor, TcpTransport};
use crate::sessions::config::{NetplayConfig, SpectatorFeed, StallPolicy};
use crate::sessions::netplay_session::{Link, NetplaySession};
use crate::telemetry::ViolationObserver;
use crate::{
    InvalidRequestKind, NetplayError, SessionRole, StreamAcceptor, Transport, MAX_DELAY_DEPTH,
};

/// Nickname used when none is set.
const DEFAULT_NICKNAME: &str = "player";

/// The [`SessionBuilder`] builds all netplay sessions.
///
/// After setting all appropriate values, use one of the `start_*` methods to
/// consume the builder and create a [`NetplaySession`] in the desired role.
///
/// ```
/// use lockstep_netplay::{LoopbackTransport, SessionBuilder, SessionRole, SessionState, StallPolicy};
/// # struct Core;
/// # impl lockstep_netplay::RetroCallbacks for Core {
/// #     fn poll_input(&mut self) {}
/// #     fn input_state(&mut self, _: u32, _: u32, _: u32, _: u32) -> i16 { 0 }
/// #     fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {}
/// #     fn audio_sample(&mut self, _: i16, _: i16) {}
/// #     fn audio_sample_batch(&mut self, s: &[i16]) -> usize { s.len() / 2 }
/// # }
/// let (to_host, _host_end) = LoopbackTransport::pair();
/// let session = SessionBuilder::new()
///     .with_delay_depth(3)?
///     .with_nickname("lucia")?
///     .with_stall_policy(StallPolicy::Wait)
///     .start_client(Core, to_host)?;
/// assert_eq!(session.role(), SessionRole::Client);
/// assert_eq!(session.current_state(), SessionState::Handshaking);
/// # Ok::<(), lockstep_netplay::NetplayError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling a start_* method"]
pub struct SessionBuilder {
    config: NetplayConfig,
    nickname: String,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            nickname,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("nickname", nickname)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            config: NetplayConfig::default(),
            nickname: DEFAULT_NICKNAME.to_owned(),
            violation_observer: None,
        }
    }

    /// Replaces the whole configuration, e.g. with a preset.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if [`NetplayConfig::validate`] rejects `config`.
    pub fn with_config(mut self, config: NetplayConfig) -> Result<Self, NetplayError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Ticks between capturing an input and applying it. A client adopts the
    /// host's depth during the handshake.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::DelayDepthTooLarge`] above [`MAX_DELAY_DEPTH`].
    pub fn with_delay_depth(mut self, delay_depth: u32) -> Result<Self, NetplayError> {
        if delay_depth > MAX_DELAY_DEPTH {
            return Err(InvalidRequestKind::DelayDepthTooLarge {
                depth: delay_depth,
                max: MAX_DELAY_DEPTH,
            }
            .into());
        }
        self.config.delay_depth = delay_depth;
        Ok(self)
    }

    /// The name announced to peers.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::NicknameTooLong`] if longer than [`MAX_NICKNAME_LEN`] bytes.
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Result<Self, NetplayError> {
        let nickname = nickname.into();
        if nickname.len() > MAX_NICKNAME_LEN {
            return Err(InvalidRequestKind::NicknameTooLong {
                len: nickname.len(),
                max: MAX_NICKNAME_LEN,
            }
            .into());
        }
        self.nickname = nickname;
        Ok(self)
    }

    /// How long `pre_frame` waits for late remote input.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    /// What happens once the stall timeout expires.
    pub fn with_stall_policy(mut self, policy: StallPolicy) -> Self {
        self.config.stall_policy = policy;
        self
    }

    /// What a spectator sink's simulation is fed.
    pub fn with_spectator_feed(mut self, feed: SpectatorFeed) -> Self {
        self.config.spectator_feed = feed;
        self
    }

    /// Spectators a host serves at once.
    pub fn with_max_spectators(mut self, max_spectators: usize) -> Self {
        self.config.max_spectators = max_spectators;
        self
    }

    /// Frames between pings to the primary peer.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::InvalidConfig`] for 0.
    pub fn with_ping_interval(mut self, frames: u32) -> Result<Self, NetplayError> {
        if frames == 0 {
            return Err(InvalidRequestKind::InvalidConfig {
                field: "ping_interval_frames",
                reason: "must be at least 1",
            }
            .into());
        }
        self.config.ping_interval_frames = frames;
        Ok(self)
    }

    /// Sets the maximum number of events to queue before the oldest are dropped.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::InvalidConfig`] for 0.
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, NetplayError> {
        if size == 0 {
            return Err(InvalidRequestKind::InvalidConfig {
                field: "event_queue_size",
                reason: "must be at least 1",
            }
            .into());
        }
        self.config.event_queue_size = size;
        Ok(self)
    }

    /// Connections that have not finished handshake and sync within `timeout`
    /// are closed. Also bounds how long [`netplay_new`] tries to connect.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// If no observer is set, violations are logged via the `tracing` crate.
    ///
    /// ```
    /// use lockstep_netplay::{telemetry::CollectingObserver, SessionBuilder};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new().with_violation_observer(observer.clone());
    /// assert!(observer.is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Hosts a match: drives port 0 and waits for one player on `acceptor`.
    /// Spectators connecting to the same acceptor are served as well.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if the configuration is invalid.
    pub fn start_host<C: RetroCallbacks>(
        self,
        callbacks: C,
        acceptor: impl StreamAcceptor + 'static,
    ) -> Result<NetplaySession<C>, NetplayError> {
        self.start(SessionRole::Host, callbacks, Link::Listen(Box::new(acceptor)))
    }

    /// Joins a host's match over `transport` and drives port 1.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if the configuration is invalid.
    pub fn start_client<C: RetroCallbacks>(
        self,
        callbacks: C,
        transport: impl Transport + 'static,
    ) -> Result<NetplaySession<C>, NetplayError> {
        self.start(
            SessionRole::Client,
            callbacks,
            Link::Connect(Box::new(transport)),
        )
    }

    /// Drives both ports locally and streams the match to spectators on `acceptor`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if the configuration is invalid.
    pub fn start_spectator_source<C: RetroCallbacks>(
        self,
        callbacks: C,
        acceptor: impl StreamAcceptor + 'static,
    ) -> Result<NetplaySession<C>, NetplayError> {
        self.start(
            SessionRole::SpectatorSource,
            callbacks,
            Link::Listen(Box::new(acceptor)),
        )
    }

    /// Watches a host's match over `transport`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] if the configuration is invalid.
    pub fn start_spectator_sink<C: RetroCallbacks>(
        self,
        callbacks: C,
        transport: impl Transport + 'static,
    ) -> Result<NetplaySession<C>, NetplayError> {
        self.start(
            SessionRole::SpectatorSink,
            callbacks,
            Link::Connect(Box::new(transport)),
        )
    }

    fn start<C: RetroCallbacks>(
        self,
        role: SessionRole,
        callbacks: C,
        link: Link,
    ) -> Result<NetplaySession<C>, NetplayError> {
        self.config.validate()?;
        let Self {
            config,
            nickname,
            violation_observer,
        } = self;
        Ok(NetplaySession::new(
            role,
            config,
            nickname,
            callbacks,
            link,
            violation_observer,
        ))
    }
}

/// Opens a netplay session over TCP.
///
/// Without a `server`, listens on `0.0.0.0:port` and hosts (or, with
/// `spectate`, streams to spectators). With a `server`, connects to
/// `server:port` as a client (or, with `spectate`, as a spectator).
///
/// # Errors
///
/// - [`NetplayError::InvalidRequest`] for a delay depth above [`MAX_DELAY_DEPTH`]
///   or a nickname above [`MAX_NICKNAME_LEN`] bytes.
/// - [`NetplayError::Socket`] if the port cannot be bound or the server cannot be reached.
pub fn netplay_new<C: RetroCallbacks>(
    server: Option<&str>,
    port: u16,
    delay_depth: u32,
    callbacks: C,
    spectate: bool,
    nickname: &str,
) -> Result<NetplaySession<C>, NetplayError> {
    let builder = SessionBuilder::new()
        .with_delay_depth(delay_depth)?
        .with_nickname(nickname)?;

    match server {
        None => {
            let acceptor = TcpAcceptor::bind(port).map_err(|e| NetplayError::Socket {
                context: format!("could not listen on port {}: {}", port, e),
            })?;
            if spectate {
                builder.start_spectator_source(callbacks, acceptor)
            } else {
                builder.start_host(callbacks, acceptor)
            }
        },
        Some(server) => {
            let transport = TcpTransport::connect((server, port), builder.config.handshake_timeout)
                .map_err(|e| NetplayError::Socket {
                    context: format!("could not connect to {}:{}: {}", server, port, e),
                })?;
            info!("Connected to {}:{}", server, port);
            if spectate {
                builder.start_spectator_sink(callbacks, transport)
            } else {
                builder.start_client(callbacks, transport)
            }
        },
    }
}

/// Says goodbye to every peer and drops the session.
pub fn netplay_free<C: RetroCallbacks>(mut session: NetplaySession<C>) {
    session.free();
}

/// Same as [`NetplaySession::pre_frame`].
///
/// # Errors
///
/// See [`NetplaySession::pre_frame`].
pub fn netplay_pre_frame<C: RetroCallbacks>(
    session: &mut NetplaySession<C>,
) -> Result<(), NetplayError> {
    session.pre_frame()
}

/// Same as [`NetplaySession::post_frame`].
///
/// # Errors
///
/// See [`NetplaySession::post_frame`].
pub fn netplay_post_frame<C: RetroCallbacks>(
    session: &mut NetplaySession<C>,
) -> Result<(), NetplayError> {
    session.post_frame()
}

/// Same as [`NetplaySession::flip_users`].
///
/// # Errors
///
/// See [`NetplaySession::flip_users`].
pub fn netplay_flip_users<C: RetroCallbacks>(
    session: &mut NetplaySession<C>,
) -> Result<(), NetplayError> {
    session.flip_users()
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
    use crate::network::loopback::{self, LoopbackTransport};
    use crate::SessionState;

    struct Idle;

    impl RetroCallbacks for Idle {
        fn poll_input(&mut self) {}

        fn input_state(&mut self, _: u32, _: u32, _: u32, _: u32) -> i16 {
            0
        }

        fn video_frame(&mut self, _: Option<&[u8]>, _: u32, _: u32, _: usize) {}

        fn audio_sample(&mut self, _: i16, _: i16) {}

        fn audio_sample_batch(&mut self, samples: &[i16]) -> usize {
            samples.len() / 2
        }
    }

    #[test]
    fn delay_depth_is_bounded() {
        assert!(SessionBuilder::new().with_delay_depth(0).is_ok());
        assert!(SessionBuilder::new()
            .with_delay_depth(MAX_DELAY_DEPTH)
            .is_ok());
        let err = SessionBuilder::new()
            .with_delay_depth(MAX_DELAY_DEPTH + 1)
            .unwrap_err();
        assert_eq!(
            err,
            NetplayError::InvalidRequest {
                kind: InvalidRequestKind::DelayDepthTooLarge {
                    depth: MAX_DELAY_DEPTH + 1,
                    max: MAX_DELAY_DEPTH
                }
            }
        );
    }

    #[test]
    fn nickname_is_bounded() {
        assert!(SessionBuilder::new().with_nickname("a".repeat(32)).is_ok());
        assert!(matches!(
            SessionBuilder::new().with_nickname("a".repeat(33)),
            Err(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::NicknameTooLong { len: 33, max: 32 }
            })
        ));
    }

    #[test]
    fn zero_event_queue_and_ping_interval_are_rejected() {
        assert!(SessionBuilder::new().with_event_queue_size(0).is_err());
        assert!(SessionBuilder::new().with_event_queue_size(1).is_ok());
        assert!(SessionBuilder::new().with_ping_interval(0).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = NetplayConfig {
            stall_poll_interval: Duration::ZERO,
            ..NetplayConfig::default()
        };
        assert!(SessionBuilder::new().with_config(config).is_err());
        assert!(SessionBuilder::new()
            .with_config(NetplayConfig::internet())
            .is_ok());
    }

    #[test]
    fn roles_follow_the_start_method() {
        let (acceptor, _connector) = loopback::listener();
        let host = SessionBuilder::new().start_host(Idle, acceptor).unwrap();
        assert_eq!(host.role(), SessionRole::Host);
        assert_eq!(host.current_state(), SessionState::Handshaking);

        let (end, _other) = LoopbackTransport::pair();
        let sink = SessionBuilder::new()
            .start_spectator_sink(Idle, end)
            .unwrap();
        assert_eq!(sink.role(), SessionRole::SpectatorSink);
        assert_eq!(sink.local_port(), None);
    }

    #[test]
    fn builder_settings_reach_the_session() {
        let (end, _other) = LoopbackTransport::pair();
        let session = SessionBuilder::new()
            .with_delay_depth(5)
            .unwrap()
            .with_stall_timeout(Duration::from_millis(20))
            .with_stall_policy(StallPolicy::Wait)
            .with_max_spectators(1)
            .start_client(Idle, end)
            .unwrap();
        assert_eq!(session.delay_depth(), 5);
        assert_eq!(session.config().stall_timeout, Duration::from_millis(20));
        assert_eq!(session.config().stall_policy, StallPolicy::Wait);
        assert_eq!(session.config().max_spectators, 1);
    }

    #[test]
    fn debug_hides_the_observer() {
        let builder = SessionBuilder::new().with_violation_observer(Arc::new(
            crate::telemetry::CollectingObserver::new(),
        ));
        let debug = format!("{builder:?}");
        assert!(debug.contains("has_violation_observer: true"));
        assert!(debug.contains("player"));
    }

    #[test]
    fn netplay_new_hosts_without_a_server() {
        let session = netplay_new(None, 0, 3, Idle, false, "host").unwrap();
        assert_eq!(session.role(), SessionRole::Host);
        assert_eq!(session.delay_depth(), 3);
        netplay_free(session);

        let source = netplay_new(None, 0, 1, Idle, true, "streamer").unwrap();
        assert_eq!(source.role(), SessionRole::SpectatorSource);
        assert_eq!(source.current_state(), SessionState::Running);
    }

    #[test]
    fn netplay_new_validates_before_touching_the_network() {
        assert!(matches!(
            netplay_new(None, 0, MAX_DELAY_DEPTH + 1, Idle, false, "host"),
            Err(NetplayError::InvalidRequest { .. })
        ));
        let long = "n".repeat(40);
        assert!(matches!(
            netplay_new(Some("127.0.0.1"), 1, 2, Idle, false, &long),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn free_functions_drive_a_session() {
        let (acceptor, _connector) = loopback::listener();
        let mut source = SessionBuilder::new()
            .start_spectator_source(Idle, acceptor)
            .unwrap();
        for _ in 0..3 {
            netplay_pre_frame(&mut source).unwrap();
            netplay_post_frame(&mut source).unwrap();
        }
        assert_eq!(source.frame_counter(), crate::Frame::new(3));
        assert!(matches!(
            netplay_post_frame(&mut source),
            Err(NetplayError::InvalidRequest { .. })
        ));
        assert!(netplay_flip_users(&mut source).is_err());
        netplay_free(source);
    }
}
