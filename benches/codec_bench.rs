//! Codec and store throughput benchmark.
//!
//! Measures delta encode/decode of operation batches, filtered shard reads
//! with range pruning, and partitioned parallel scans.
//!
//! Run: cargo bench --bench codec_bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use histdb::codec::{decode, encode};
use histdb::store::{open_for_read, write_features, IdFilter, ParallelScan};
use histdb::{ElementKind, Feature, Operation, OperationKind, ScanConfig, StoreConfig};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_way(id: i64) -> Feature {
    let mut ops = vec![Operation::new(id, ElementKind::Line, OperationKind::CreateWay, id % 500, 1_400_000_000 + id, id / 20, 1)];
    for n in 0..8 {
        ops.push(
            Operation::new(id, ElementKind::Line, OperationKind::AddWayNode, id % 500, 1_400_000_000 + id, id / 20, 1)
                .with_reference(id * 100 + n, Some(n as u32))
                .with_coordinate(13.4 + n as f64 * 0.0001, 52.5 + id as f64 * 0.00001),
        );
    }
    ops.push(
        Operation::new(id, ElementKind::Line, OperationKind::AddTag, id % 500, 1_400_000_000 + id, id / 20, 1)
            .with_tag("highway", "residential"),
    );
    Feature::new(id, ElementKind::Line, ops)
}

fn make_batch(features: usize) -> Vec<Operation> {
    (0..features as i64).flat_map(|id| make_way(id).into_operations()).collect()
}

fn populated_store(features: usize, rollover: u64) -> (TempDir, StoreConfig) {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        rollover_entries: rollover,
        scan: ScanConfig {
            workers: 4,
            ..ScanConfig::default()
        },
        ..StoreConfig::default()
    };
    let ways: Vec<Feature> = (0..features as i64).map(make_way).collect();
    write_features(dir.path(), &ways, &config).unwrap();
    (dir, config)
}

// ---------------------------------------------------------------------------
// Benchmarks: delta codec
// ---------------------------------------------------------------------------

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for features in [100, 1_000, 10_000] {
        let batch = make_batch(features);
        let bytes = encode(&batch);
        group.throughput(Throughput::Elements(batch.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", features), &batch, |b, batch| {
            b.iter(|| black_box(encode(batch)));
        });
        group.bench_with_input(BenchmarkId::new("decode", features), &bytes, |b, bytes| {
            b.iter(|| black_box(decode(bytes).unwrap()));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmarks: reads
// ---------------------------------------------------------------------------

fn bench_filtered_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("filtered_read");
    let (dir, config) = populated_store(20_000, 20_000);

    for wanted in [10, 1_000] {
        let ids: Vec<i64> = (0..wanted).map(|i| i * (20_000 / wanted)).collect();
        group.bench_with_input(BenchmarkId::new("ids", wanted), &ids, |b, ids| {
            b.iter_batched(
                || IdFilter::new(ids.clone()),
                |filter| {
                    let reader = open_for_read(dir.path(), ElementKind::Line, Some(filter), false, &config).unwrap();
                    black_box(reader.count())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_parallel_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_scan");
    group.sample_size(10);
    let (dir, config) = populated_store(20_000, 20_000);

    group.bench_function("20k_ways_4_workers", |b| {
        b.iter(|| black_box(ParallelScan::start(dir.path(), None, &config).unwrap().collect_all().unwrap().len()));
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_filtered_read, bench_parallel_scan);
criterion_main!(benches);
