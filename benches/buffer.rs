//! Benchmark ingestion buffer batch inserts.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use live_log_viewer::client::IngestionBuffer;
use live_log_viewer::protocol::{LogEntry, NewLogEntry};

fn entries(start: u64, count: usize) -> Vec<LogEntry> {
    (0..count as u64)
        .map(|n| {
            NewLogEntry {
                message: format!("message {}", start + n),
                app_name: format!("app-{}", n % 8),
                host_name: "bench-host".into(),
                ..Default::default()
            }
            .into_entry(start + n)
        })
        .collect()
}

fn bench_add_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_batch_full_buffer");

    for batch in [10usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let mut buffer = IngestionBuffer::new(50_000, 1_000);
            buffer.add_batch(entries(0, 50_000));
            let mut next = 50_000;
            b.iter_batched(
                || {
                    let incoming = entries(next, batch);
                    next += batch as u64;
                    incoming
                },
                |incoming| buffer.add_batch(black_box(incoming)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_oversized_batch(c: &mut Criterion) {
    c.bench_function("add_batch_larger_than_capacity", |b| {
        let mut buffer = IngestionBuffer::new(5_000, 1_000);
        b.iter_batched(
            || entries(0, 20_000),
            |incoming| buffer.add_batch(black_box(incoming)),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_add_batch_sizes, bench_oversized_batch);
criterion_main!(benches);
