//! Fuzz target for DelayBuffer operations.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary operation sequences, including invalid ports
//! - A rejected push leaves `next_expected` untouched
//! - A read never returns a record stamped with another frame

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use lockstep_netplay::{DelayBuffer, Frame, FrameRecord, Port, MAX_DELAY_DEPTH, NUM_PORTS};

#[derive(Debug, Arbitrary)]
enum BufferOp {
    /// Push the next expected frame, or `skew` frames off it.
    Push { port: u8, skew: i8, buttons: u16 },
    Get { port: u8, back: u8 },
    Swap { a: u8, b: u8, back: u8 },
    Reset { port: u8, ahead: u8 },
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    delay_depth: u8,
    start: u16,
    ops: Vec<BufferOp>,
}

fn port(raw: u8) -> Port {
    // mostly valid ports, sometimes one past the end
    Port::new(raw % (NUM_PORTS as u8 + 1))
}

fuzz_target!(|input: FuzzInput| {
    let delay_depth = u32::from(input.delay_depth) % (MAX_DELAY_DEPTH + 1);
    let mut buffer = DelayBuffer::new(NUM_PORTS, delay_depth, Frame::new(u64::from(input.start)));

    for op in input.ops.into_iter().take(512) {
        match op {
            BufferOp::Push { port: raw, skew, buttons } => {
                let port = port(raw);
                let next = buffer.next_expected(port).as_u64();
                let frame = Frame::new(next.saturating_add_signed(i64::from(skew)));
                let mut record = FrameRecord::neutral(frame);
                record.button_mask = u64::from(buttons);
                if buffer.push(port, frame, record).is_err() {
                    assert_eq!(buffer.next_expected(port).as_u64(), next);
                }
            },
            BufferOp::Get { port: raw, back } => {
                let port = port(raw);
                let next = buffer.next_expected(port).as_u64();
                let frame = Frame::new(next.saturating_sub(u64::from(back)));
                if let Some(record) = buffer.get(port, frame) {
                    assert_eq!(record.frame_number, frame);
                }
            },
            BufferOp::Swap { a, b, back } => {
                let from = buffer.next_expected(port(a)).as_u64().saturating_sub(u64::from(back));
                let _ = buffer.swap_ports_from(port(a), port(b), Frame::new(from));
            },
            BufferOp::Reset { port: raw, ahead } => {
                let port = port(raw);
                let next = buffer.next_expected(port).as_u64() + u64::from(ahead);
                let _ = buffer.reset_port(port, Frame::new(next));
            },
        }
    }
});
