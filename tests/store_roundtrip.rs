//! Integration test: operation file store write/read paths.
//!
//! Validates that:
//! 1. Appending in two sessions decodes the same as one session
//! 2. Shards roll over at the configured entry limit without splitting features
//! 3. Range pruning never drops a wanted feature
//! 4. A filter disjoint from a file's id range skips that file
//! 5. A parallel scan returns exactly what a sequential read returns
//! 6. The manifest survives a read/write cycle byte for byte

use std::collections::BTreeMap;
use std::path::Path;

use histdb::store::manifest::OperationFileManifest;
use histdb::store::{open_for_read, write_features, IdFilter, OperationFileWriter, ParallelScan};
use histdb::{ElementKind, Feature, Operation, OperationKind, ScanConfig, StoreConfig};
use proptest::prelude::*;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Coordinates on the 1e-7 grid so decoded values compare exactly.
fn grid(units: i64) -> f64 {
    units as f64 / 1e7
}

fn node(id: i64) -> Feature {
    let ts = 1_500_000_000 + id * 7;
    Feature::new(
        id,
        ElementKind::Point,
        vec![
            Operation::new(id, ElementKind::Point, OperationKind::CreateNode, id % 13, ts, id / 4, 1)
                .with_coordinate(grid(134_000_000 + id * 31), grid(525_000_000 - id * 17)),
            Operation::new(id, ElementKind::Point, OperationKind::AddTag, id % 13, ts, id / 4, 1)
                .with_tag("name", format!("node {id}")),
            Operation::new(id, ElementKind::Point, OperationKind::MoveNode, id % 11, ts + 60, id / 4 + 1, 2)
                .with_coordinate(grid(134_000_001 + id * 31), grid(525_000_002 - id * 17)),
        ],
    )
}

fn relation(id: i64) -> Feature {
    let mut ops = vec![Operation::new(id, ElementKind::Relation, OperationKind::CreateRelation, 3, 1_600_000_000, 9, 1)];
    for m in 0..(id % 4 + 1) {
        ops.push(
            Operation::new(id, ElementKind::Relation, OperationKind::AddMember, 3, 1_600_000_000, 9, 1)
                .with_reference(id * 10 + m, Some(m as u32)),
        );
    }
    Feature::new(id, ElementKind::Relation, ops)
}

fn read_all(dir: &Path, kind: ElementKind, filter: Option<IdFilter>, config: &StoreConfig) -> Vec<Feature> {
    open_for_read(dir, kind, filter, false, config)
        .unwrap()
        .collect::<histdb::Result<Vec<_>>>()
        .unwrap()
}

fn by_id(features: Vec<Feature>) -> BTreeMap<i64, Feature> {
    features.into_iter().map(|f| (f.id(), f)).collect()
}

fn small_files(rollover: u64) -> StoreConfig {
    StoreConfig {
        rollover_entries: rollover,
        ops_per_frame: 4,
        scan: ScanConfig {
            workers: 3,
            queue_capacity: 16,
            batch_size: 5,
            ..ScanConfig::default()
        },
        ..StoreConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Resumable append
// ---------------------------------------------------------------------------

#[test]
fn test_two_sessions_decode_like_one() {
    let config = small_files(1_000);
    let (a, b, c) = (node(1), node(2), node(3));

    let split = TempDir::new().unwrap();
    let mut w = OperationFileWriter::open_for_append(split.path(), ElementKind::Point, &config).unwrap();
    w.write([&a, &b]).unwrap();
    w.close().unwrap();
    let mut w = OperationFileWriter::open_for_append(split.path(), ElementKind::Point, &config).unwrap();
    w.write([&c]).unwrap();
    let manifest = w.close().unwrap();
    assert_eq!(manifest.points.len(), 1, "resumed session must append to the same file");
    assert_eq!(manifest.points[0].feature_count, 3);
    assert_eq!(manifest.points[0].entry_count, 9);

    let whole = TempDir::new().unwrap();
    let mut w = OperationFileWriter::open_for_append(whole.path(), ElementKind::Point, &config).unwrap();
    w.write([&a, &b, &c]).unwrap();
    w.close().unwrap();

    let from_split = read_all(split.path(), ElementKind::Point, None, &config);
    let from_whole = read_all(whole.path(), ElementKind::Point, None, &config);
    assert_eq!(from_split, from_whole);
    assert_eq!(from_split, vec![a, b, c]);
}

#[test]
fn test_many_resumed_sessions_across_rollover() {
    let dir = TempDir::new().unwrap();
    let config = small_files(10);
    let features: Vec<Feature> = (1..=30).map(node).collect();

    for chunk in features.chunks(4) {
        let mut w = OperationFileWriter::open_for_append(dir.path(), ElementKind::Point, &config).unwrap();
        w.write(chunk).unwrap();
        w.close().unwrap();
    }

    assert_eq!(read_all(dir.path(), ElementKind::Point, None, &config), features);
}

// ---------------------------------------------------------------------------
// Rollover
// ---------------------------------------------------------------------------

#[test]
fn test_rollover_at_entry_limit() {
    let dir = TempDir::new().unwrap();
    // Three operations per node: a file closes after four nodes (12 >= 10).
    let config = small_files(10);
    let features: Vec<Feature> = (1..=10).map(node).collect();
    write_features(dir.path(), &features, &config).unwrap();

    let manifest = OperationFileManifest::read_from(dir.path()).unwrap();
    let counts: Vec<(u32, u64, u64)> = manifest
        .points
        .iter()
        .map(|f| (f.file_id, f.feature_count, f.entry_count))
        .collect();
    assert_eq!(counts, vec![(0, 4, 12), (1, 4, 12), (2, 2, 6)]);
    assert_eq!((manifest.points[1].min_id, manifest.points[1].max_id), (5, 8));
    for file in &manifest.points {
        assert!(dir.path().join(file.file_name()).exists());
    }
    assert_eq!(read_all(dir.path(), ElementKind::Point, None, &config), features);
}

#[test]
fn test_rollover_on_exact_boundary_leaves_no_empty_file() {
    let dir = TempDir::new().unwrap();
    let config = small_files(6);
    let features: Vec<Feature> = (1..=4).map(node).collect();
    write_features(dir.path(), &features, &config).unwrap();

    let manifest = OperationFileManifest::read_from(dir.path()).unwrap();
    assert_eq!(manifest.points.len(), 2);
    assert!(!dir.path().join("operation_n_2").exists());
}

// ---------------------------------------------------------------------------
// Filtered reads
// ---------------------------------------------------------------------------

#[test]
fn test_disjoint_filter_skips_file() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::default();
    let features: Vec<Feature> = [50, 120, 500].into_iter().map(node).collect();
    write_features(dir.path(), &features, &config).unwrap();

    let mut reader =
        open_for_read(dir.path(), ElementKind::Point, Some(IdFilter::new(vec![10, 20])), false, &config).unwrap();
    assert!(reader.next_feature().unwrap().is_none());
    assert_eq!(reader.stats().files_listed, 1);
    assert_eq!(reader.stats().files_skipped_range, 1);
    assert_eq!(reader.stats().files_read, 0);
}

#[test]
fn test_constrained_read_skips_sparse_files() {
    let dir = TempDir::new().unwrap();
    let mut config = small_files(9);
    config.constrained_min_relations = 2;
    let features: Vec<Feature> = (1..=12).map(relation).collect();
    write_features(dir.path(), &features, &config).unwrap();
    let manifest = OperationFileManifest::read_from(dir.path()).unwrap();
    assert!(manifest.relations.len() > 2);

    let first = &manifest.relations[0];
    let last = manifest.relations.last().unwrap();
    // Two wanted ids in the first file, one in the last.
    let wanted = vec![first.min_id, first.max_id, last.max_id];
    let mut reader =
        open_for_read(dir.path(), ElementKind::Relation, Some(IdFilter::new(wanted.clone())), true, &config).unwrap();
    let mut got = Vec::new();
    while let Some(f) = reader.next_feature().unwrap() {
        got.push(f.id());
    }
    assert_eq!(got, vec![first.min_id, first.max_id]);
    assert!(reader.stats().files_skipped_constrained >= 1);

    let unconstrained = read_all(dir.path(), ElementKind::Relation, Some(IdFilter::new(wanted.clone())), &config);
    assert_eq!(unconstrained.iter().map(Feature::id).collect::<Vec<_>>(), {
        let mut w = wanted;
        w.sort_unstable();
        w
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_pruned_read_equals_filtered_full_read(
        ids in prop::collection::btree_set(1i64..400, 1..60),
        wanted in prop::collection::vec(-10i64..420, 0..40),
        rollover in 3u64..30,
    ) {
        let dir = TempDir::new().unwrap();
        let config = small_files(rollover);
        let features: Vec<Feature> = ids.iter().copied().map(relation).collect();
        write_features(dir.path(), &features, &config).unwrap();

        let filter = IdFilter::new(wanted.clone());
        let expected: Vec<Feature> = read_all(dir.path(), ElementKind::Relation, None, &config)
            .into_iter()
            .filter(|f| filter.contains(f.id()))
            .collect();
        let pruned = read_all(dir.path(), ElementKind::Relation, Some(filter), &config);
        prop_assert_eq!(pruned, expected);
    }
}

// ---------------------------------------------------------------------------
// Parallel scan
// ---------------------------------------------------------------------------

#[test]
fn test_parallel_scan_matches_sequential_read() {
    let dir = TempDir::new().unwrap();
    let config = small_files(20);
    let points: Vec<Feature> = (1..=90).map(node).collect();
    let relations: Vec<Feature> = (1..=40).map(relation).collect();
    write_features(dir.path(), &points, &config).unwrap();
    write_features(dir.path(), &relations, &config).unwrap();

    let mut sequential = read_all(dir.path(), ElementKind::Point, None, &config);
    sequential.extend(read_all(dir.path(), ElementKind::Relation, None, &config));

    let parallel = ParallelScan::start(dir.path(), None, &config).unwrap().collect_all().unwrap();
    assert_eq!(parallel.len(), sequential.len());

    let key = |f: &Feature| (f.kind() as u8, f.id());
    let mut parallel = parallel;
    parallel.sort_by_key(key);
    sequential.sort_by_key(key);
    assert_eq!(parallel, sequential);
}

#[test]
fn test_parallel_scan_with_filter() {
    let dir = TempDir::new().unwrap();
    let config = small_files(15);
    let points: Vec<Feature> = (1..=60).map(node).collect();
    write_features(dir.path(), &points, &config).unwrap();

    let filter = IdFilter::new(vec![2, 17, 18, 59, 1_000]);
    let scan = ParallelScan::start(dir.path(), Some(filter), &config).unwrap();
    let mut got = by_id(scan.collect_all().unwrap());
    assert_eq!(got.keys().copied().collect::<Vec<_>>(), vec![2, 17, 18, 59]);
    assert_eq!(got.remove(&17), Some(node(17)));
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[test]
fn test_manifest_round_trip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let config = small_files(12);
    write_features(dir.path(), &(1..=20).map(node).collect::<Vec<_>>(), &config).unwrap();
    write_features(dir.path(), &(1..=9).map(relation).collect::<Vec<_>>(), &config).unwrap();

    let original = std::fs::read(OperationFileManifest::path(dir.path())).unwrap();
    let manifest = OperationFileManifest::read_from(dir.path()).unwrap();

    let copy = TempDir::new().unwrap();
    manifest.write_to(copy.path()).unwrap();
    let rewritten = std::fs::read(OperationFileManifest::path(copy.path())).unwrap();
    assert_eq!(original, rewritten);
    assert_eq!(OperationFileManifest::read_from(copy.path()).unwrap(), manifest);
}

#[test]
fn test_missing_shard_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = small_files(6);
    write_features(dir.path(), &(1..=6).map(node).collect::<Vec<_>>(), &config).unwrap();
    std::fs::remove_file(dir.path().join("operation_n_1")).unwrap();

    let err = open_for_read(dir.path(), ElementKind::Point, None, false, &config)
        .err()
        .expect("missing shard must fail the read");
    assert!(matches!(err, histdb::StoreError::MissingShard { .. }), "got {err:?}");
}
