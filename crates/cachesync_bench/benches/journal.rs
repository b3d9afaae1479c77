//! Journal benchmarks.

use cachesync_bench::random_data;
use cachesync_storage::{FileBackend, InMemoryBackend, Journal};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Benchmark frame appends to an in-memory journal.
fn bench_inmemory_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_inmemory_append");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (mut journal, _) = Journal::open(Box::new(InMemoryBackend::new())).unwrap();
            let data = random_data(size);

            b.iter(|| {
                journal.append(black_box(&data)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark frame appends to a file journal.
fn bench_file_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_file_append");
    group.sample_size(50);

    for size in [256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let backend = FileBackend::open(&temp_dir.path().join("bench.journal")).unwrap();
            let (mut journal, _) = Journal::open(Box::new(backend)).unwrap();
            let data = random_data(size);

            b.iter(|| {
                journal.append(black_box(&data)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark appends that sync after every frame.
fn bench_file_sync_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_file_sync_append");
    group.sample_size(20);

    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(&temp_dir.path().join("bench.journal")).unwrap();
    let (mut journal, _) = Journal::open(Box::new(backend)).unwrap();
    journal.set_sync_on_append(true);
    let data = random_data(1024);

    group.bench_function("after_1kb_frame", |b| {
        b.iter(|| journal.append(&data).unwrap());
    });

    group.finish();
}

/// Benchmark replaying a journal on open.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_replay");
    group.sample_size(20);

    for frames in [100, 1000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(frames), frames, |b, &frames| {
            let backend = InMemoryBackend::new();
            let (mut journal, _) = Journal::open(Box::new(backend.clone())).unwrap();
            let data = random_data(256);
            for _ in 0..frames {
                journal.append(&data).unwrap();
            }

            b.iter(|| {
                let (_, replay) = Journal::open(Box::new(backend.clone())).unwrap();
                black_box(replay.frames.len());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_inmemory_append,
    bench_file_append,
    bench_file_sync_append,
    bench_replay,
);

criterion_main!(benches);
