//! Operation log benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use replica_bench::generate_inserts;
use replica_master::{OperationLog, DEFAULT_OPLOG_CAPACITY};
use replica_protocol::{LogCursor, LogRead};

/// Benchmark appends to a log with room to spare.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("oplog_append");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let ops = generate_inserts(1, size);
            let mut log = OperationLog::new(DEFAULT_OPLOG_CAPACITY);
            b.iter(|| {
                let op_time = log.append(black_box(ops[0].clone())).unwrap();
                black_box(op_time);
            });
        });
    }
    group.finish();
}

/// Benchmark appends into a full log, each evicting from the front.
fn bench_append_evicting(c: &mut Criterion) {
    let mut group = c.benchmark_group("oplog_append_evicting");

    for capacity_kb in [64, 1024].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity_kb),
            capacity_kb,
            |b, &capacity_kb| {
                let mut log = OperationLog::new(capacity_kb * 1024);
                for op in generate_inserts(capacity_kb * 8, 256) {
                    log.append(op).unwrap();
                }
                let op = generate_inserts(1, 256).remove(0);
                b.iter(|| {
                    let op_time = log.append(black_box(op.clone())).unwrap();
                    black_box(op_time);
                });
            },
        );
    }
    group.finish();
}

/// Benchmark tailing reads at various batch sizes.
fn bench_read_from(c: &mut Criterion) {
    let mut group = c.benchmark_group("oplog_read_from");

    let mut log = OperationLog::new(usize::MAX);
    let mut times = Vec::new();
    for op in generate_inserts(10_000, 128) {
        times.push(log.append(op).unwrap());
    }

    for batch in [1, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let mut idx = 0;
            b.iter(|| {
                let cursor = LogCursor::at(times[idx]);
                let read = log.read_from_limited(black_box(cursor), batch);
                idx = (idx + 1) % (times.len() - batch);
                black_box(read);
            });
        });
    }

    // Reading from an evicted position only reports the gap.
    group.bench_function("gap", |b| {
        let mut log = OperationLog::new(16 * 1024);
        for op in generate_inserts(1000, 128) {
            log.append(op).unwrap();
        }
        b.iter(|| {
            let read = log.read_from_limited(black_box(LogCursor::start()), 100);
            assert!(matches!(read, LogRead::Gap { .. }));
            black_box(read);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_append, bench_append_evicting, bench_read_from);

criterion_main!(benches);
