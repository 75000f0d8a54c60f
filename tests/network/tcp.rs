//! Full sessions over real TCP sockets on localhost.
//!
//! These bind real ports, so they run serially.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{SocketAddr, TcpListener};

use crate::common::{
    lockstep_tick, scripted_record, test_config, ScriptedPad, Side, CLIENT_SEED, HOST_SEED,
};
use lockstep_netplay::{
    netplay_free, netplay_new, NetplayError, SessionBuilder, SessionRole, SessionState,
    TcpAcceptor, TcpTransport,
};
use serial_test::serial;
use web_time::{Duration, Instant};

const SYNC_DEADLINE: Duration = Duration::from_secs(5);

/// Polls until every side runs; TCP needs real time to deliver.
fn synchronize_over_tcp(sides: &mut [&mut Side]) {
    let started = Instant::now();
    while started.elapsed() < SYNC_DEADLINE {
        for side in sides.iter_mut() {
            side.session.poll_remote_clients();
        }
        if sides
            .iter()
            .all(|side| side.state() == SessionState::Running)
        {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    let states: Vec<_> = sides.iter().map(|side| side.state()).collect();
    panic!("sessions did not synchronize over TCP: {states:?}");
}

/// A port that was free a moment ago.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
#[serial]
fn host_and_client_play_over_tcp() {
    let config = test_config(3);
    let acceptor = TcpAcceptor::bind_addr(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let host = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    let transport = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
    let client = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_client(ScriptedPad::new(CLIENT_SEED), transport)
        .unwrap();
    let (mut host, mut client) = (Side::new(host), Side::new(client));
    synchronize_over_tcp(&mut [&mut host, &mut client]);

    for _ in 0..30 {
        lockstep_tick(&mut host, &mut client).unwrap();
    }

    assert_eq!(host.applied, client.applied);
    assert_eq!(host.core, client.core);
    assert_eq!(host.applied[&20][1], scripted_record(CLIENT_SEED, 17));
    let stats = client.session.network_stats().unwrap();
    assert!(stats.bytes_received > 0);
}

#[test]
#[serial]
fn netplay_new_opens_both_ends() {
    let port = free_port();
    let host = netplay_new(None, port, 2, ScriptedPad::new(HOST_SEED), false, "host").unwrap();
    let client = netplay_new(
        Some("127.0.0.1"),
        port,
        2,
        ScriptedPad::new(CLIENT_SEED),
        false,
        "client",
    )
    .unwrap();
    assert_eq!(host.role(), SessionRole::Host);
    assert_eq!(client.role(), SessionRole::Client);

    let (mut host, mut client) = (Side::new(host), Side::new(client));
    synchronize_over_tcp(&mut [&mut host, &mut client]);
    for _ in 0..10 {
        lockstep_tick(&mut host, &mut client).unwrap();
    }
    assert_eq!(host.applied, client.applied);
    assert_eq!(client.session.peer_nickname(), Some("host"));

    netplay_free(client.session);
    for _ in 0..5 {
        host.tick().unwrap();
    }
    assert_eq!(host.state(), SessionState::Degraded);
}

#[test]
#[serial]
fn connecting_to_nothing_is_a_socket_error() {
    let port = free_port();
    let result = netplay_new(
        Some("127.0.0.1"),
        port,
        2,
        ScriptedPad::new(CLIENT_SEED),
        false,
        "client",
    );
    assert!(
        matches!(result, Err(NetplayError::Socket { .. })),
        "{:?}",
        result.map(|session| session.role())
    );
}

#[test]
#[serial]
fn a_spectator_watches_over_tcp() {
    let port = free_port();
    let source = netplay_new(None, port, 2, ScriptedPad::new(HOST_SEED), true, "source").unwrap();
    let sink = netplay_new(
        Some("127.0.0.1"),
        port,
        2,
        ScriptedPad::new(0),
        true,
        "watcher",
    )
    .unwrap();
    assert_eq!(source.role(), SessionRole::SpectatorSource);
    assert_eq!(sink.role(), SessionRole::SpectatorSink);

    let (mut source, mut sink) = (Side::new(source), Side::new(sink));
    synchronize_over_tcp(&mut [&mut source, &mut sink]);
    let start = sink.frame();
    for _ in 0..10 {
        source.tick().unwrap();
        sink.tick().unwrap();
    }
    for (frame, records) in &sink.applied {
        assert_eq!(source.applied[frame], *records);
    }
    assert_eq!(sink.applied.len(), 10);
    assert_eq!(sink.frame(), start + 10);
}
