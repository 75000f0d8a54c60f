//! Benchmarks for DelayBuffer operations
//!
//! Run with: cargo bench --bench delay_buffer
//!
//! Every tick pushes one record per port and reads one back, so these are on the
//! per-frame path of every session.

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_netplay::{DelayBuffer, Frame, FrameRecord, Port, NUM_PORTS};
use std::hint::black_box;

const P0: Port = Port::new(0);
const P1: Port = Port::new(1);

fn record(frame: u64) -> FrameRecord {
    let mut record = FrameRecord::neutral(Frame::new(frame));
    record.button_mask = frame & 0xffff;
    record.set_analog_axis(0, (frame % 300) as i16);
    record
}

/// Push-then-read of one frame on both ports, the steady state of a running session.
fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("DelayBuffer tick");

    for delay_depth in [0u32, 2, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("push_and_get", delay_depth),
            &delay_depth,
            |b, &delay_depth| {
                let mut buffer = DelayBuffer::new(NUM_PORTS, delay_depth, Frame::ZERO);
                let mut frame = 0u64;
                b.iter(|| {
                    let current = Frame::new(frame);
                    buffer.push(P0, current, record(frame)).unwrap();
                    buffer.push(P1, current, record(frame)).unwrap();
                    let target = Frame::new(frame.saturating_sub(u64::from(delay_depth)));
                    black_box(buffer.get(P0, target));
                    black_box(buffer.get(P1, target));
                    frame += 1;
                });
            },
        );
    }

    group.finish();
}

fn bench_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("DelayBuffer swap");

    for delay_depth in [2u32, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("swap_ports_from", delay_depth),
            &delay_depth,
            |b, &delay_depth| {
                let mut buffer = DelayBuffer::new(NUM_PORTS, delay_depth, Frame::ZERO);
                let filled = u64::from(delay_depth) * 2;
                for frame in 0..filled {
                    buffer.push(P0, Frame::new(frame), record(frame)).unwrap();
                    buffer.push(P1, Frame::new(frame), record(frame + 1)).unwrap();
                }
                let from = Frame::new(filled - u64::from(delay_depth) / 2);
                b.iter(|| {
                    buffer.swap_ports_from(P0, P1, black_box(from)).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_tick, bench_swap);
criterion_main!(benches);
