//! Spectators: joining mid-match, replaying the combined stream, misbehaving watchers.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use crate::common::{
    lockstep_tick, run_until, running_pair, scripted_record, synchronize, test_config, ScriptedPad,
    Side, CLIENT_SEED, HOST_SEED, MAX_SYNC_ITERATIONS,
};
use lockstep_netplay::network::loopback::{self, LoopbackConnector};
use lockstep_netplay::telemetry::{CollectingObserver, ViolationKind};
use lockstep_netplay::{
    CloseReason, Connection, Frame, FrameRecord, Handshake, Message, NetplayConfig, NetplayError,
    NetplayEvent, Port, PortDriver, SessionBuilder, SessionRole, SessionState, SpectatorFeed,
};

const P0: Port = Port::new(0);
const P1: Port = Port::new(1);

fn join_sink(connector: &LoopbackConnector, config: NetplayConfig, nickname: &str) -> Side {
    let session = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .with_nickname(nickname)
        .unwrap()
        .start_spectator_sink(ScriptedPad::new(0), connector.connect())
        .unwrap();
    Side::new(session)
}

/// One player tick followed by one spectator tick.
fn tick_all(host: &mut Side, client: &mut Side, sink: &mut Side) {
    lockstep_tick(host, client).unwrap();
    sink.tick().unwrap();
}

// ============================================================================
// Joining
// ============================================================================

#[test]
fn a_spectator_joins_mid_match() {
    let config = test_config(3);
    let (mut host, mut client, connector) = running_pair(config);
    run_until(&mut host, &mut client, 50);

    let mut sink = join_sink(&connector, config, "watcher");
    assert_eq!(sink.session.role(), SessionRole::SpectatorSink);
    assert_eq!(sink.session.local_port(), None);
    for _ in 0..10 {
        tick_all(&mut host, &mut client, &mut sink);
    }

    assert_eq!(host.session.num_spectators(), 1);
    assert!(host.events().contains(&NetplayEvent::SpectatorJoined {
        nickname: "watcher".to_owned(),
        start_frame: Frame::new(50),
    }));
    let events = sink.events();
    assert!(events.contains(&NetplayEvent::PeerConnected {
        nickname: "host".to_owned(),
        spectate: false
    }));
    assert!(events.contains(&NetplayEvent::Synchronized {
        start_frame: Frame::new(50)
    }));

    // the sink simulates the frames it joined at, with the records the players applied
    assert_eq!(sink.frame(), 60);
    assert_eq!(sink.applied.keys().copied().min(), Some(50));
    for (frame, records) in &sink.applied {
        assert_eq!(host.applied[frame], *records);
    }
    assert_eq!(sink.applied[&55][0], scripted_record(HOST_SEED, 52));
    assert_eq!(sink.applied[&55][1], scripted_record(CLIENT_SEED, 52));
    assert_eq!(sink.session.spectated_inputs(), sink.session.applied_inputs());
    assert_eq!(sink.session.port_driver(P0), Ok(PortDriver::Remote));
    assert_eq!(sink.session.port_driver(P1), Ok(PortDriver::Remote));
    assert!(sink.session.flip_users().is_err());
}

#[test]
fn a_neutral_feed_hides_the_input_from_the_core() {
    let config = test_config(2);
    let (mut host, mut client, connector) = running_pair(config);
    run_until(&mut host, &mut client, 10);

    let mut sink = join_sink(&connector, config, "watcher");
    for _ in 0..6 {
        tick_all(&mut host, &mut client, &mut sink);
    }

    assert!(sink.seen.values().all(|masks| *masks == [0, 0]));
    assert!(sink
        .applied
        .values()
        .any(|records| !records.iter().all(FrameRecord::is_neutral)));
}

#[test]
fn a_replay_feed_shows_the_core_what_the_players_pressed() {
    let config = NetplayConfig {
        spectator_feed: SpectatorFeed::Replay,
        ..test_config(2)
    };
    let (mut host, mut client, connector) = running_pair(config);
    run_until(&mut host, &mut client, 20);

    let mut sink = join_sink(&connector, config, "watcher");
    for _ in 0..8 {
        tick_all(&mut host, &mut client, &mut sink);
    }

    assert_eq!(sink.seen.len(), 8);
    for (frame, masks) in &sink.seen {
        assert_eq!(host.seen[frame], *masks);
    }
}

#[test]
fn spectators_beyond_the_limit_are_turned_away() {
    let config = NetplayConfig {
        max_spectators: 1,
        ..test_config(2)
    };
    let (mut host, mut client, connector) = running_pair(config);
    let mut first = join_sink(&connector, config, "first");
    tick_all(&mut host, &mut client, &mut first);

    let mut second = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_spectator_sink(ScriptedPad::new(0), connector.connect())
        .unwrap();
    let mut outcome = Err(NetplayError::NotSynchronized);
    for _ in 0..MAX_SYNC_ITERATIONS {
        tick_all(&mut host, &mut client, &mut first);
        outcome = second.pre_frame();
        if outcome != Err(NetplayError::NotSynchronized) {
            break;
        }
    }

    assert!(
        matches!(outcome, Err(NetplayError::HandshakeFailed { .. })),
        "{outcome:?}"
    );
    assert_eq!(host.session.num_spectators(), 1);
    assert_eq!(first.state(), SessionState::Running);
}

// ============================================================================
// Leaving and misbehaving
// ============================================================================

#[test]
fn a_leaving_spectator_does_not_disturb_the_match() {
    let config = test_config(2);
    let (mut host, mut client, connector) = running_pair(config);
    let mut sink = join_sink(&connector, config, "watcher");
    for _ in 0..4 {
        tick_all(&mut host, &mut client, &mut sink);
    }
    drop(sink);

    run_until(&mut host, &mut client, 10);
    assert_eq!(host.session.num_spectators(), 0);
    assert!(host.events().contains(&NetplayEvent::SpectatorLeft {
        nickname: "watcher".to_owned(),
        reason: CloseReason::PeerClosed,
    }));
    assert_eq!(host.state(), SessionState::Running);
    assert_eq!(host.applied, client.applied);
}

#[test]
fn spectator_input_is_ignored() {
    let config = test_config(2);
    let observer = Arc::new(CollectingObserver::new());
    let (acceptor, connector) = loopback::listener();
    let host = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .with_violation_observer(observer.clone())
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    let client = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_client(ScriptedPad::new(CLIENT_SEED), connector.connect())
        .unwrap();
    let (mut host, mut client) = (Side::new(host), Side::new(client));
    synchronize(&mut [&mut host, &mut client]);

    let mut raw = Connection::initiate(
        Box::new(connector.connect()),
        Handshake::new(2, true, "raw"),
        &config,
    );
    lockstep_tick(&mut host, &mut client).unwrap();
    raw.receive_available();
    assert!(raw.is_alive());

    raw.send(&Message::Input(scripted_record(HOST_SEED, 3))).unwrap();
    raw.send(&Message::Input(FrameRecord::neutral(Frame::new(4))))
        .unwrap();
    run_until(&mut host, &mut client, 10);

    assert!(observer.has_violation(ViolationKind::NetworkProtocol));
    assert_eq!(host.session.num_spectators(), 1);
    for frame in 3..10 {
        assert_eq!(host.applied[&frame][0], scripted_record(HOST_SEED, frame - 2));
        assert_eq!(host.applied[&frame][1], scripted_record(CLIENT_SEED, frame - 2));
    }
    assert_eq!(host.applied, client.applied);
}

// ============================================================================
// Spectator sources
// ============================================================================

#[test]
fn a_spectator_source_streams_both_local_ports() {
    let config = test_config(2);
    let (acceptor, connector) = loopback::listener();
    let mut source = Side::new(
        SessionBuilder::new()
            .with_config(config)
            .unwrap()
            .start_spectator_source(ScriptedPad::new(HOST_SEED), acceptor)
            .unwrap(),
    );
    assert_eq!(source.state(), SessionState::Running);
    assert_eq!(source.session.port_driver(P1), Ok(PortDriver::Local));

    let mut sink = join_sink(&connector, config, "watcher");
    for _ in 0..8 {
        source.tick().unwrap();
        sink.tick().unwrap();
    }

    assert_eq!(source.session.num_spectators(), 1);
    assert_eq!(sink.applied, source.applied);
    assert_eq!(sink.applied[&5][0], scripted_record(HOST_SEED, 3));
    assert_eq!(sink.applied[&5][1], FrameRecord::neutral(Frame::new(3)));
}
