//! Fuzz target for wire message decoding.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - A decoded message never claims more bytes than it was given
//! - Re-encoding a decoded message reproduces the consumed bytes

#![no_main]

use libfuzzer_sys::fuzz_target;
use lockstep_netplay::__internal::{decode, encode};

fuzz_target!(|data: &[u8]| {
    let mut offset = 0;
    while let Some(rest) = data.get(offset..) {
        let Ok((message, used)) = decode(rest) else {
            break;
        };
        assert!(used > 0 && used <= rest.len());
        let encoded = encode(&message).expect("decoded messages re-encode");
        assert_eq!(encoded.as_slice(), &rest[..used]);
        offset += used;
    }
});
