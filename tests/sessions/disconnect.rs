//! Losing the peer: stalls, stall policies and degraded play.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{run_until, running_pair, scripted_record, test_config, HOST_SEED};
use lockstep_netplay::{
    CloseReason, Frame, FrameRecord, NetplayConfig, NetplayError, NetplayEvent, SessionState,
    StallPolicy,
};
use web_time::{Duration, Instant};

fn stall_config(policy: StallPolicy) -> NetplayConfig {
    NetplayConfig {
        stall_timeout: Duration::from_millis(30),
        stall_policy: policy,
        ..test_config(2)
    }
}

// ============================================================================
// Stalls
// ============================================================================

#[test]
fn waiting_policy_reports_the_stall_and_recovers() {
    let (mut host, mut client, _connector) = running_pair(stall_config(StallPolicy::Wait));
    run_until(&mut host, &mut client, 5);

    // the client's captures 5 and 6 are still missing when the host reaches tick 7
    host.tick().unwrap();
    host.tick().unwrap();
    let result = host.begin();
    assert!(
        matches!(
            result,
            Err(NetplayError::ConnectionStalled { frame, waited_ms }) if frame == Frame::new(5) && waited_ms >= 30
        ),
        "{result:?}"
    );
    assert!(!result.unwrap_err().is_fatal());
    assert_eq!(host.state(), SessionState::Running);
    assert!(host
        .events()
        .iter()
        .any(|event| matches!(event, NetplayEvent::ConnectionStalled { frame, .. } if *frame == Frame::new(5))));

    // the client catches up and the retry goes through
    client.tick().unwrap();
    host.begin().unwrap();
    assert_eq!(host.frame(), 7);
    host.end().unwrap();
}

#[test]
fn drop_policy_continues_alone() {
    let (mut host, mut client, _connector) = running_pair(stall_config(StallPolicy::DropPeer));
    run_until(&mut host, &mut client, 5);

    host.tick().unwrap();
    host.tick().unwrap();
    host.begin().unwrap();

    assert_eq!(host.state(), SessionState::Degraded);
    let applied = host.applied[&7];
    assert_eq!(applied[0], scripted_record(HOST_SEED, 5));
    assert_eq!(applied[1], FrameRecord::neutral(Frame::new(5)));

    let events = host.events();
    assert!(events.contains(&NetplayEvent::PeerDisconnected {
        nickname: "client".to_owned(),
        reason: CloseReason::Stalled,
    }));
    assert!(events.contains(&NetplayEvent::Degraded {
        frame: Frame::new(7)
    }));
    host.end().unwrap();
    assert!(host.session.network_stats().is_none());
}

// ============================================================================
// Disconnects
// ============================================================================

#[test]
fn disconnect_degrades_without_waiting() {
    let config = NetplayConfig {
        stall_timeout: Duration::from_secs(5),
        ..test_config(2)
    };
    let (mut host, mut client, _connector) = running_pair(config);
    run_until(&mut host, &mut client, 6);
    client.session.free();

    let started = Instant::now();
    for _ in 0..6 {
        host.tick().unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(host.state(), SessionState::Degraded);

    let events = host.events();
    assert!(events.contains(&NetplayEvent::PeerDisconnected {
        nickname: "client".to_owned(),
        reason: CloseReason::PeerClosed,
    }));
    assert!(events
        .iter()
        .any(|event| matches!(event, NetplayEvent::Degraded { .. })));

    // the client's last capture was frame 5, everything after is neutral
    for tick in 8..12 {
        let applied = host.applied[&tick];
        assert_eq!(applied[0], scripted_record(HOST_SEED, tick - 2));
        assert_eq!(applied[1], FrameRecord::neutral(Frame::new(tick - 2)));
    }
    assert!(host.session.flip_users().is_err());
}

#[test]
fn dropped_transport_counts_as_disconnect() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));
    run_until(&mut host, &mut client, 4);
    drop(client);

    for _ in 0..5 {
        host.tick().unwrap();
    }
    assert_eq!(host.state(), SessionState::Degraded);
}

#[test]
fn the_client_degrades_when_the_host_leaves() {
    let (mut host, mut client, _connector) = running_pair(test_config(2));
    run_until(&mut host, &mut client, 4);
    host.session.free();

    for _ in 0..4 {
        client.tick().unwrap();
    }
    assert_eq!(client.state(), SessionState::Degraded);
    assert_eq!(client.session.peer_nickname(), Some("host"));
    assert_eq!(host.session.pre_frame(), Err(NetplayError::SessionClosed));
}

#[test]
fn a_host_whose_player_leaves_before_sync_waits_again() {
    let (mut host, client, connector) = crate::common::host_and_client(test_config(2));
    // one poll: the host sees the handshake and sends its sync
    host.session.poll_remote_clients();
    assert_eq!(host.state(), SessionState::Syncing);
    drop(client);

    host.session.poll_remote_clients();
    assert_eq!(host.state(), SessionState::Handshaking);
    assert_eq!(host.session.peer_nickname(), None);

    // and accepts the next player
    let mut next = crate::common::Side::new(
        lockstep_netplay::SessionBuilder::new()
            .with_config(test_config(2))
            .unwrap()
            .start_client(
                crate::common::ScriptedPad::new(crate::common::CLIENT_SEED),
                connector.connect(),
            )
            .unwrap(),
    );
    crate::common::synchronize(&mut [&mut host, &mut next]);
    assert_eq!(host.state(), SessionState::Running);
}
