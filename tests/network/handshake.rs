//! Handshakes and message framing between sessions and foreign peers over loopback.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::io::{ErrorKind, Read, Write};

use crate::common::{
    lockstep_tick, scripted_record, synchronize, test_config, ScriptedPad, Side, CLIENT_SEED,
    HOST_SEED, MAX_SYNC_ITERATIONS,
};
use lockstep_netplay::__internal::{MAGIC, PROTOCOL_VERSION};
use lockstep_netplay::network::loopback::{self, LoopbackConnector};
use lockstep_netplay::{
    CloseReason, Connection, Frame, FrameRecord, Handshake, Message, NetplayConfig, NetplayError,
    NetplayEvent, SessionBuilder, SessionState,
};
use web_time::{Duration, Instant};

fn start_host(config: NetplayConfig) -> (Side, LoopbackConnector) {
    let (acceptor, connector) = loopback::listener();
    let host = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .with_nickname("host")
        .unwrap()
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    (Side::new(host), connector)
}

fn start_client(config: NetplayConfig, connector: &LoopbackConnector) -> Side {
    Side::new(
        SessionBuilder::new()
            .with_config(config)
            .unwrap()
            .with_nickname("client")
            .unwrap()
            .start_client(ScriptedPad::new(CLIENT_SEED), connector.connect())
            .unwrap(),
    )
}

/// Polls `host` until `transport` reads end of stream.
fn until_dropped(host: &mut Side, transport: &mut impl Read) {
    let mut buf = [0u8; 256];
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(2) {
        host.session.poll_remote_clients();
        match transport.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::WouldBlock => {},
            Err(e) => panic!("unexpected read error: {e}"),
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("the host kept the connection open");
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn sessions_play_over_a_trickling_stream() {
    let config = test_config(2);
    let (acceptor, connector) = loopback::listener();
    let host = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    let client = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_client(
            ScriptedPad::new(CLIENT_SEED),
            connector.connect_with_max_chunk(7),
        )
        .unwrap();
    let (mut host, mut client) = (Side::new(host), Side::new(client));

    // every poll moves at most one chunk per direction
    let mut polls = 0;
    while host.state() != SessionState::Running || client.state() != SessionState::Running {
        host.session.poll_remote_clients();
        client.session.poll_remote_clients();
        polls += 1;
        assert!(polls < 1000, "{:?} / {:?}", host.state(), client.state());
    }

    for _ in 0..12 {
        lockstep_tick(&mut host, &mut client).unwrap();
    }
    assert_eq!(host.applied, client.applied);
    assert_eq!(host.applied[&11][0], scripted_record(HOST_SEED, 9));
    assert_eq!(client.applied[&11][1], scripted_record(CLIENT_SEED, 9));
}

// ============================================================================
// Foreign peers
// ============================================================================

#[test]
fn a_peer_with_another_protocol_version_is_dropped() {
    let config = test_config(2);
    let (mut host, connector) = start_host(config);

    let mut stale = Handshake::new(2, false, "stale");
    stale.protocol_version = PROTOCOL_VERSION + 1;
    let mut peer = Connection::initiate(Box::new(connector.connect()), stale, &config);
    for _ in 0..5 {
        host.session.poll_remote_clients();
        peer.receive_available();
    }

    assert!(!peer.is_alive());
    assert_eq!(peer.close_reason(), Some(&CloseReason::PeerClosed));
    assert_eq!(host.state(), SessionState::Handshaking);
    assert!(host.events().is_empty());

    // the slot is still free
    let mut client = start_client(config, &connector);
    synchronize(&mut [&mut host, &mut client]);
    assert_eq!(host.session.peer_nickname(), Some("client"));
}

#[test]
fn garbage_instead_of_a_handshake_is_dropped() {
    let config = test_config(2);
    let (mut host, connector) = start_host(config);

    let mut stranger = connector.connect();
    stranger.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    until_dropped(&mut host, &mut stranger);
    assert_eq!(host.state(), SessionState::Handshaking);

    let mut client = start_client(config, &connector);
    synchronize(&mut [&mut host, &mut client]);
}

#[test]
fn a_handshake_claiming_a_huge_nickname_is_dropped() {
    let config = test_config(2);
    let (mut host, connector) = start_host(config);

    let mut body = 0u32.to_le_bytes().to_vec();
    body.extend_from_slice(&MAGIC.to_le_bytes());
    body.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    body.extend_from_slice(&2u32.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&(1u64 << 46).to_le_bytes());
    let mut stranger = connector.connect();
    stranger
        .write_all(&(body.len() as u32).to_le_bytes())
        .unwrap();
    stranger.write_all(&body).unwrap();

    until_dropped(&mut host, &mut stranger);
    assert_eq!(host.state(), SessionState::Handshaking);

    let mut client = start_client(config, &connector);
    synchronize(&mut [&mut host, &mut client]);
}

#[test]
fn a_peer_racing_past_the_delay_window_is_a_desync() {
    let config = test_config(2);
    let (mut host, connector) = start_host(config);
    let mut racer = Connection::initiate(
        Box::new(connector.connect()),
        Handshake::new(2, false, "racer"),
        &config,
    );
    for _ in 0..MAX_SYNC_ITERATIONS {
        if host.state() != SessionState::Handshaking {
            break;
        }
        host.session.poll_remote_clients();
        racer.receive_available();
    }
    racer
        .send(&Message::SyncAck {
            start_frame: Frame::ZERO,
        })
        .unwrap();
    host.session.poll_remote_clients();
    assert_eq!(host.state(), SessionState::Running);

    // captures 0 and 1 are legal this early, the rest could never be consumed
    for frame in 0..2 {
        racer
            .send(&Message::Input(scripted_record(CLIENT_SEED, frame)))
            .unwrap();
    }
    for frame in 10_000..10_064 {
        racer
            .send(&Message::Input(FrameRecord::neutral(Frame::new(frame))))
            .unwrap();
    }

    let result = host.tick();
    assert!(
        matches!(result, Err(NetplayError::Desync { frame, .. }) if frame >= Frame::new(10_000)),
        "{result:?}"
    );
    assert_eq!(host.state(), SessionState::Closed);
    assert!(host
        .events()
        .iter()
        .any(|event| matches!(event, NetplayEvent::DesyncDetected { .. })));
    assert_eq!(host.session.pre_frame(), Err(NetplayError::SessionClosed));
}

#[test]
fn a_silent_peer_times_out() {
    let config = NetplayConfig {
        handshake_timeout: Duration::from_millis(20),
        ..test_config(2)
    };
    let (mut host, connector) = start_host(config);

    let mut silent = connector.connect();
    until_dropped(&mut host, &mut silent);
    assert_eq!(host.state(), SessionState::Handshaking);
}

#[test]
fn spectators_and_players_are_told_apart() {
    let config = test_config(2);
    let (mut host, connector) = start_host(config);

    let mut watcher = Connection::initiate(
        Box::new(connector.connect()),
        Handshake::new(2, true, "watcher"),
        &config,
    );
    let mut client = start_client(config, &connector);
    synchronize(&mut [&mut host, &mut client]);
    watcher.receive_available();

    assert!(watcher.is_alive());
    assert_eq!(watcher.nickname(), "host");
    assert_eq!(host.session.num_spectators(), 1);
    assert_eq!(host.session.peer_nickname(), Some("client"));

    let events = host.events();
    assert!(events.contains(&NetplayEvent::PeerConnected {
        nickname: "client".to_owned(),
        spectate: false
    }));
    assert!(events
        .iter()
        .any(|event| matches!(event, NetplayEvent::SpectatorJoined { nickname, .. } if nickname == "watcher")));
}
