//! Benchmarks for the 40-byte wire codec
//!
//! Covers single-frame encode/decode and walking a multi-frame read buffer.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use crane_relay::codec::{self, FrameCheck};
use crane_relay::test_utils::sample_frame;
use crane_relay::types::{FRAME_LEN, Message};
use std::hint::black_box;

fn bench_encode(c: &mut Criterion) {
    let message = Message::new(1, 1_700_000_000_000, 5, [10, 20, 30], [1.5, 2.5, 3.5]);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(FRAME_LEN as u64));

    group.bench_function("message_encode", |b| b.iter(|| black_box(black_box(&message).encode())));
    group.bench_function("heartbeat", |b| {
        b.iter(|| black_box(Message::heartbeat(0, black_box(42), black_box(1_700_000_000_000))))
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = sample_frame(7);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(FRAME_LEN as u64));

    group.bench_function("lenient", |b| {
        b.iter(|| black_box(codec::decode_with(black_box(&frame), FrameCheck::Lenient)))
    });
    group.bench_function("strict", |b| {
        b.iter(|| black_box(codec::decode_with(black_box(&frame), FrameCheck::Strict)))
    });
    group.bench_function("short_buffer", |b| {
        b.iter(|| black_box(codec::decode(black_box(&frame[..39]))))
    });

    group.finish();
}

fn bench_frames(c: &mut Criterion) {
    let buffer: Vec<u8> = (0u8..100).flat_map(sample_frame).collect();

    let mut group = c.benchmark_group("frames");
    group.throughput(Throughput::Bytes(buffer.len() as u64));

    group.bench_function("iterate_100", |b| {
        b.iter(|| black_box(codec::frames(black_box(&buffer)).count()))
    });
    group.bench_function("decode_at_last", |b| {
        b.iter(|| black_box(codec::decode_at(black_box(&buffer), 99)))
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_frames);
criterion_main!(benches);
