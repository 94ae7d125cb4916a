//! Aggregation and decoding benchmarks using Criterion.rs
//!
//! Run with: cargo bench -p twinsync-core

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;
use twinsync_core::{DataType, ObservationMessage, RunningStatistics};

fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("running_statistics_push");
    for n in [1_000u64, 100_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut stats = RunningStatistics::new();
                for i in 0..n {
                    stats.push(black_box((i % 97) as f64 * 0.5));
                }
                black_box(stats.summary())
            });
        });
    }
    group.finish();
}

fn bench_decode_envelope(c: &mut Criterion) {
    let body = ObservationMessage::new("D1", 5, DataType::Position, json!([52.37, 4.89, 2.0])).to_vec();

    c.bench_function("decode_position_envelope", |b| {
        b.iter(|| {
            let message = ObservationMessage::from_slice(black_box(&body)).unwrap();
            black_box(message.data_type.decode(&message.value).unwrap())
        });
    });
}

criterion_group!(benches, bench_push, bench_decode_envelope);
criterion_main!(benches);
