//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a scripted controller and a deterministic core stub
//! - `test_utils`: session setup, interleaved ticking and other helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{running_pair, test_config, Side};
//! ```

pub mod stubs;
pub mod test_utils;

// Re-export commonly used items for convenience.
#[allow(unused_imports)]
pub use stubs::{scripted_record, CoreStub, ScriptedPad};
#[allow(unused_imports)]
pub use test_utils::{
    host_and_client, init_tracing, lockstep_tick, run_until, running_pair, synchronize, test_config, Side,
    CLIENT_SEED, HOST_SEED, MAX_SYNC_ITERATIONS,
};
