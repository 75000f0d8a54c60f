//! Swapping which user drives which port.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    lockstep_tick, run_until, running_pair, scripted_record, test_config, CLIENT_SEED, HOST_SEED,
};
use lockstep_netplay::{
    Frame, InvalidRequestKind, NetplayError, NetplayEvent, Port, PortDriver, SessionState,
};

const P0: Port = Port::new(0);
const P1: Port = Port::new(1);

#[test]
fn flip_takes_effect_at_the_same_frame_on_both_sides() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));
    run_until(&mut host, &mut client, 6);

    host.session.flip_users().unwrap();
    assert_eq!(
        host.state(),
        SessionState::Flipping {
            effective_frame: Frame::new(6)
        }
    );
    run_until(&mut host, &mut client, 16);

    assert_eq!(host.state(), SessionState::Running);
    assert_eq!(client.state(), SessionState::Running);
    assert_eq!(host.session.local_port(), Some(P1));
    assert_eq!(client.session.local_port(), Some(P0));

    for side in [&host, &client] {
        let driver = |port, frame| side.session.port_driver_at(port, Frame::new(frame)).unwrap();
        let (mine, theirs) = if side.session.role().is_host() {
            (P0, P1)
        } else {
            (P1, P0)
        };
        assert_eq!(driver(mine, 5), PortDriver::Local);
        assert_eq!(driver(theirs, 5), PortDriver::Remote);
        assert_eq!(driver(mine, 6), PortDriver::Remote);
        assert_eq!(driver(theirs, 6), PortDriver::Local);
    }

    // captures up to frame 5 are applied up to tick 8
    for tick in 3..9 {
        let applied = host.applied[&tick];
        assert_eq!(applied[0], scripted_record(HOST_SEED, tick - 3));
        assert_eq!(applied[1], scripted_record(CLIENT_SEED, tick - 3));
    }
    for tick in 9..16 {
        let applied = host.applied[&tick];
        assert_eq!(applied[0], scripted_record(CLIENT_SEED, tick - 3));
        assert_eq!(applied[1], scripted_record(HOST_SEED, tick - 3));
    }
    assert_eq!(host.applied, client.applied);
    assert_eq!(host.core, client.core);

    let flipped = NetplayEvent::UsersFlipped {
        effective_frame: Frame::new(6),
    };
    assert!(host.events().contains(&flipped));
    assert!(client.events().contains(&flipped));
}

#[test]
fn the_client_can_flip_as_well() {
    let (mut host, mut client, _connector) = running_pair(test_config(2));
    run_until(&mut host, &mut client, 4);

    client.session.flip_users().unwrap();
    run_until(&mut host, &mut client, 10);

    assert_eq!(host.session.local_port(), Some(P1));
    assert_eq!(client.state(), SessionState::Running);
    assert_eq!(host.applied[&6][0], scripted_record(CLIENT_SEED, 4));
    assert_eq!(host.applied[&5][0], scripted_record(HOST_SEED, 3));
    assert_eq!(host.applied, client.applied);
}

#[test]
fn users_can_be_flipped_back() {
    let (mut host, mut client, _connector) = running_pair(test_config(2));
    run_until(&mut host, &mut client, 4);
    host.session.flip_users().unwrap();
    run_until(&mut host, &mut client, 8);
    client.session.flip_users().unwrap();
    run_until(&mut host, &mut client, 14);

    assert_eq!(host.session.local_port(), Some(P0));
    assert_eq!(host.applied[&7][0], scripted_record(CLIENT_SEED, 5));
    assert_eq!(host.applied[&11][0], scripted_record(HOST_SEED, 9));
    assert_eq!(host.applied, client.applied);
}

#[test]
fn flips_are_rejected_during_a_tick() {
    let (mut host, _client, _connector) = running_pair(test_config(2));
    host.begin().unwrap();
    assert!(matches!(
        host.session.flip_users(),
        Err(NetplayError::InvalidRequest {
            kind: InvalidRequestKind::FlipNotAllowed { .. }
        })
    ));
}

#[test]
fn a_pending_flip_blocks_another() {
    let (mut host, mut client, _connector) = running_pair(test_config(2));
    run_until(&mut host, &mut client, 3);
    host.session.flip_users().unwrap();
    assert!(host.session.flip_users().is_err());
}

#[test]
fn simultaneous_flips_are_a_desync() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));
    run_until(&mut host, &mut client, 6);
    host.session.flip_users().unwrap();
    client.session.flip_users().unwrap();

    let host_result = host.begin();
    let client_result = client.begin();

    assert!(
        matches!(host_result, Err(NetplayError::Desync { .. })),
        "{host_result:?}"
    );
    assert!(
        matches!(client_result, Err(NetplayError::Desync { .. })),
        "{client_result:?}"
    );
    assert_eq!(host.state(), SessionState::Closed);
    assert!(host
        .events()
        .iter()
        .any(|event| matches!(event, NetplayEvent::DesyncDetected { .. })));
    assert_eq!(host.session.pre_frame(), Err(NetplayError::SessionClosed));
}

#[test]
fn lockstep_survives_a_flip_right_after_sync() {
    let (mut host, mut client, _connector) = running_pair(test_config(3));
    host.session.flip_users().unwrap();
    for _ in 0..8 {
        lockstep_tick(&mut host, &mut client).unwrap();
    }
    assert_eq!(host.applied[&3][0], scripted_record(CLIENT_SEED, 0));
    assert_eq!(host.applied, client.applied);
}
