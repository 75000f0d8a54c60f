//! Shared test utilities for integration tests.
//!
//! Most tests run a host and a client in one thread over the in-memory loopback
//! transport and interleave their ticks the way two real machines would:
//!
//! ```ignore
//! host.begin()?;    // pre_frame + core tick
//! client.begin()?;
//! host.end()?;      // post_frame
//! client.end()?;
//! ```
//!
//! With a delay depth of at least 1 this order never stalls, because the input
//! a tick needs was sent `delay_depth` ticks earlier.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::collections::BTreeMap;

use lockstep_netplay::network::loopback::{self, LoopbackConnector};
use lockstep_netplay::{
    FrameRecord, NetplayConfig, NetplayEvent, NetplayResult, NetplaySession, SessionBuilder,
    SessionState, StallPolicy, NUM_PORTS,
};
use web_time::Duration;

use super::stubs::{CoreStub, ScriptedPad};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound of poll rounds for a handshake over loopback.
pub const MAX_SYNC_ITERATIONS: usize = 50;

pub const HOST_SEED: u64 = 0x5EED_0001;
pub const CLIENT_SEED: u64 = 0x5EED_0002;

// ============================================================================
// Sides
// ============================================================================

/// A session plus the core it drives, with the inputs applied on every tick.
#[derive(Debug)]
pub struct Side {
    pub session: NetplaySession<ScriptedPad>,
    pub core: CoreStub,
    /// Records applied per simulated frame.
    pub applied: BTreeMap<u64, [FrameRecord; NUM_PORTS]>,
    /// Joypad bits the core saw per simulated frame.
    pub seen: BTreeMap<u64, [u16; 2]>,
}

impl Side {
    pub fn new(session: NetplaySession<ScriptedPad>) -> Self {
        Self {
            session,
            core: CoreStub::default(),
            applied: BTreeMap::new(),
            seen: BTreeMap::new(),
        }
    }

    /// `pre_frame` followed by one core tick.
    pub fn begin(&mut self) -> NetplayResult<()> {
        self.session.pre_frame()?;
        let frame = self.session.frame_counter().as_u64();
        self.applied
            .insert(frame, self.session.applied_inputs().unwrap());
        let interceptor = self.session.interceptor_mut();
        interceptor.callbacks_mut().frame = frame;
        self.core.step(interceptor);
        self.seen.insert(frame, self.core.last_masks);
        Ok(())
    }

    pub fn end(&mut self) -> NetplayResult<()> {
        self.session.post_frame()
    }

    pub fn tick(&mut self) -> NetplayResult<()> {
        self.begin()?;
        self.end()
    }

    pub fn frame(&self) -> u64 {
        self.session.frame_counter().as_u64()
    }

    pub fn state(&self) -> SessionState {
        self.session.current_state()
    }

    pub fn events(&mut self) -> Vec<NetplayEvent> {
        self.session.events().collect()
    }
}

// ============================================================================
// Setup helpers
// ============================================================================

/// Defaults for single-threaded runs: a stall is a bug, so surface it as an error.
pub fn test_config(delay_depth: u32) -> NetplayConfig {
    NetplayConfig {
        delay_depth,
        stall_timeout: Duration::from_millis(500),
        stall_policy: StallPolicy::Wait,
        ..NetplayConfig::default()
    }
}

/// Routes `tracing` output through the test harness so it only shows for failing tests.
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A host listening on a fresh loopback acceptor and a client connected to it, not yet synchronized.
pub fn host_and_client(config: NetplayConfig) -> (Side, Side, LoopbackConnector) {
    init_tracing();
    let (acceptor, connector) = loopback::listener();
    let host = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .with_nickname("host")
        .unwrap()
        .start_host(ScriptedPad::new(HOST_SEED), acceptor)
        .unwrap();
    let client = SessionBuilder::new()
        .with_config(config)
        .unwrap()
        .with_nickname("client")
        .unwrap()
        .start_client(ScriptedPad::new(CLIENT_SEED), connector.connect())
        .unwrap();
    (Side::new(host), Side::new(client), connector)
}

/// Polls every side until all of them are running.
pub fn synchronize(sides: &mut [&mut Side]) {
    for _ in 0..MAX_SYNC_ITERATIONS {
        for side in sides.iter_mut() {
            side.session.poll_remote_clients();
        }
        if sides
            .iter()
            .all(|side| side.state() == SessionState::Running)
        {
            return;
        }
    }
    let states: Vec<_> = sides.iter().map(|side| side.state()).collect();
    panic!("sessions did not synchronize: {states:?}");
}

/// A synchronized host/client pair.
pub fn running_pair(config: NetplayConfig) -> (Side, Side, LoopbackConnector) {
    let (mut host, mut client, connector) = host_and_client(config);
    synchronize(&mut [&mut host, &mut client]);
    (host, client, connector)
}

/// One interleaved tick of both sides.
pub fn lockstep_tick(host: &mut Side, client: &mut Side) -> NetplayResult<()> {
    host.begin()?;
    client.begin()?;
    host.end()?;
    client.end()
}

/// Interleaved ticks until both sides reach `frame`.
pub fn run_until(host: &mut Side, client: &mut Side, frame: u64) {
    while host.frame() < frame {
        lockstep_tick(host, client).unwrap();
    }
    assert_eq!(client.frame(), frame);
}
