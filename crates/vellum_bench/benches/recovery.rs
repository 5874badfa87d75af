//! Collector and recovery benchmarks.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use vellum_bench::{open, populate};
use vellum_storage::MemoryVolume;

/// One collector pass moving `n` committed inserts into the datafile.
fn bench_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");

    for n in [100, 1000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || {
                    let (service, collection) = open(&MemoryVolume::new());
                    populate(&collection, n, 128);
                    service
                },
                |service| service.flush_wal(true).unwrap(),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Opening after a crash with `n` uncollected inserts in the WAL.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_replay");
    group.sample_size(20);

    for n in [100, 1000, 10_000] {
        let volume = MemoryVolume::new();
        {
            let (service, collection) = open(&volume);
            populate(&collection, n, 128);
            service.crash();
        }

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &volume, |b, volume| {
            b.iter_batched(
                || volume.deep_clone(),
                |copy| {
                    let (service, collection) = open(&copy);
                    assert_eq!(collection.count(), n as u64);
                    service.crash();
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Opening a cleanly closed directory whose datafile holds `n` documents.
fn bench_clean_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("clean_open");
    group.sample_size(20);

    for n in [1000, 10_000] {
        let volume = MemoryVolume::new();
        {
            let (service, collection) = open(&volume);
            populate(&collection, n, 128);
            drop(collection);
            service.close().unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(n), &volume, |b, volume| {
            b.iter(|| {
                let (service, collection) = open(volume);
                assert_eq!(collection.count(), n as u64);
                drop(collection);
                service.crash();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_collect, bench_replay, bench_clean_open);
criterion_main!(benches);
