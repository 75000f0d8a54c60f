//! Host/client lockstep over the loopback transport.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    host_and_client, lockstep_tick, run_until, running_pair, scripted_record, synchronize,
    test_config, Side, CLIENT_SEED, HOST_SEED, MAX_SYNC_ITERATIONS,
};
use crate::common::stubs::ScriptedPad;
use lockstep_netplay::{
    Frame, FrameRecord, NetplayConfig, NetplayError, NetplayEvent, Port, PortDriver,
    SessionBuilder, SessionRole, SessionState,
};

const P0: Port = Port::new(0);
const P1: Port = Port::new(1);

// ============================================================================
// Handshake and Sync
// ============================================================================

#[test]
fn sessions_start_handshaking() {
    let (mut host, mut client, _connector) = host_and_client(test_config(3));
    assert_eq!(host.state(), SessionState::Handshaking);
    assert_eq!(client.state(), SessionState::Handshaking);
    assert_eq!(host.session.role(), SessionRole::Host);
    assert_eq!(client.session.role(), SessionRole::Client);
    assert_eq!(host.session.local_port(), Some(P0));
    assert_eq!(client.session.local_port(), Some(P1));
    assert_eq!(host.session.pre_frame(), Err(NetplayError::NotSynchronized));
}

#[test]
fn handshake_reports_both_peers() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));

    assert_eq!(host.session.peer_nickname(), Some("client"));
    assert_eq!(client.session.peer_nickname(), Some("host"));
    assert_eq!(
        host.events(),
        vec![
            NetplayEvent::PeerConnected {
                nickname: "client".to_owned(),
                spectate: false
            },
            NetplayEvent::Synchronized {
                start_frame: Frame::ZERO
            },
        ]
    );
    assert_eq!(
        client.events(),
        vec![
            NetplayEvent::PeerConnected {
                nickname: "host".to_owned(),
                spectate: false
            },
            NetplayEvent::Synchronized {
                start_frame: Frame::ZERO
            },
        ]
    );
}

#[test]
fn client_adopts_the_host_delay_depth() {
    let (acceptor, connector) = lockstep_netplay::network::loopback::listener();
    let host = SessionBuilder::new()
        .with_config(test_config(4))
        .unwrap()
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    let client = SessionBuilder::new()
        .with_config(test_config(1))
        .unwrap()
        .start_client(ScriptedPad::new(CLIENT_SEED), connector.connect())
        .unwrap();
    let (mut host, mut client) = (Side::new(host), Side::new(client));
    synchronize(&mut [&mut host, &mut client]);

    assert_eq!(client.session.delay_depth(), 4);
    run_until(&mut host, &mut client, 6);
    for frame in 0..4 {
        assert!(client.applied[&frame].iter().all(FrameRecord::is_neutral));
    }
    assert_eq!(client.applied[&4][0], scripted_record(HOST_SEED, 0));
    assert_eq!(host.applied, client.applied);
}

#[test]
fn a_too_deep_host_is_a_protocol_mismatch() {
    let (acceptor, connector) = lockstep_netplay::network::loopback::listener();
    let mut host = SessionBuilder::new()
        .with_delay_depth(8)
        .unwrap()
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    let config = NetplayConfig {
        max_adopted_delay_depth: 4,
        ..test_config(2)
    };
    let mut client = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .start_client(ScriptedPad::new(CLIENT_SEED), connector.connect())
        .unwrap();

    let mut outcome = Err(NetplayError::NotSynchronized);
    for _ in 0..MAX_SYNC_ITERATIONS {
        host.poll_remote_clients();
        outcome = client.pre_frame();
        if outcome != Err(NetplayError::NotSynchronized) {
            break;
        }
    }
    assert_eq!(
        outcome,
        Err(NetplayError::ProtocolMismatch {
            local: 4,
            remote: 8
        })
    );
    assert_eq!(client.current_state(), SessionState::Closed);
    // the failure is reported once
    assert_eq!(client.pre_frame(), Err(NetplayError::SessionClosed));
}

#[test]
fn a_second_player_is_turned_away() {
    let (mut host, mut client, connector) = running_pair(test_config(2));
    let mut intruder = SessionBuilder::new()
        .with_nickname("intruder")
        .unwrap()
        .start_client(ScriptedPad::new(7), connector.connect())
        .unwrap();

    let mut outcome = Err(NetplayError::NotSynchronized);
    for _ in 0..MAX_SYNC_ITERATIONS {
        lockstep_tick(&mut host, &mut client).unwrap();
        outcome = intruder.pre_frame();
        if outcome != Err(NetplayError::NotSynchronized) {
            break;
        }
    }
    assert!(
        matches!(outcome, Err(NetplayError::HandshakeFailed { .. })),
        "{outcome:?}"
    );
    assert_eq!(host.state(), SessionState::Running);
    assert_eq!(host.session.num_spectators(), 0);
    assert_eq!(host.session.peer_nickname(), Some("client"));
}

// ============================================================================
// Lockstep
// ============================================================================

#[test]
fn both_sides_apply_identical_inputs() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));
    run_until(&mut host, &mut client, 10);

    assert_eq!(host.applied, client.applied);
    assert_eq!(host.seen, client.seen);
    assert_eq!(host.core, client.core);

    for frame in 0..3 {
        let applied = host.applied[&frame];
        assert!(applied.iter().all(FrameRecord::is_neutral));
        assert_eq!(applied[0].frame_number, Frame::new(frame));
    }
    for frame in 3..10 {
        let applied = host.applied[&frame];
        assert_eq!(applied[0], scripted_record(HOST_SEED, frame - 3));
        assert_eq!(applied[1], scripted_record(CLIENT_SEED, frame - 3));
    }
}

#[test]
fn records_stay_readable_per_port() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));
    run_until(&mut host, &mut client, 8);

    let capture = Frame::new(4);
    assert_eq!(
        host.session.record_at(P0, capture),
        Some(scripted_record(HOST_SEED, 4))
    );
    assert_eq!(
        client.session.record_at(P0, capture),
        Some(scripted_record(HOST_SEED, 4))
    );
    assert_eq!(host.session.port_driver(P0), Ok(PortDriver::Local));
    assert_eq!(client.session.port_driver(P0), Ok(PortDriver::Remote));
}

#[test]
fn the_core_sees_remote_input_on_the_remote_port() {
    let (mut host, mut client, _connector) = running_pair(test_config(2));
    run_until(&mut host, &mut client, 6);

    let expected = scripted_record(CLIENT_SEED, 3).button_mask as u16;
    assert_eq!(host.seen[&5][1], expected);
    assert_eq!(client.seen[&5][1], expected);
}

#[test]
fn pre_and_post_frame_alternate() {
    let (mut host, _client, _connector) = running_pair(test_config(2));
    host.session.pre_frame().unwrap();
    assert!(matches!(
        host.session.pre_frame(),
        Err(NetplayError::InvalidRequest { .. })
    ));
    host.session.post_frame().unwrap();
    assert!(matches!(
        host.session.post_frame(),
        Err(NetplayError::InvalidRequest { .. })
    ));
    assert_eq!(host.frame(), 1);
}

#[test]
fn pings_update_the_estimate() {
    let config = NetplayConfig {
        ping_interval_frames: 1,
        ..test_config(2)
    };
    let (mut host, mut client, _connector) = running_pair(config);
    run_until(&mut host, &mut client, 10);
    // pick up the client's last input and pong
    host.session.poll_remote_clients();

    assert!(host
        .events()
        .iter()
        .any(|event| matches!(event, NetplayEvent::PingUpdated { .. })));
    let stats = host.session.network_stats().unwrap();
    assert!(stats.ping_ms.is_some());
    assert!(stats.messages_sent > 10);
    assert_eq!(stats.last_frame_acked, Some(Frame::new(9)));
}

#[test]
fn free_says_goodbye() {
    let (mut host, mut client, _connector) = running_pair(test_config(2));
    run_until(&mut host, &mut client, 3);
    lockstep_netplay::netplay_free(client.session);

    // the host keeps running on its own
    for _ in 0..4 {
        host.tick().unwrap();
    }
    assert_eq!(host.state(), SessionState::Degraded);
}
