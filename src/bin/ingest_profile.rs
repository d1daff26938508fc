//! Ingest profile: synthetic feature ingestion under a small memory budget.
//!
//! Builds indexes of increasing size with a memory limit just above the
//! process's starting RSS, so the spill controller has to work. Prints
//! spill statistics and the on-disk footprint per run.
//!
//! Run: cargo run --release --bin ingest_profile [max_features]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::Context;
use histdb::spill::{MemoryProbe, SystemMemoryProbe};
use histdb::{ElementKind, Feature, IndexBuilder, IndexReader, Operation, OperationKind, SpillConfig, StoreConfig};

// ── Temp directory (avoids dev-dependency on tempfile) ───────────────────

static COUNTER: AtomicUsize = AtomicUsize::new(0);

struct TmpDir(PathBuf);

impl TmpDir {
    fn new() -> anyhow::Result<Self> {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        let path = std::env::temp_dir().join(format!("histdb-ingest-{}-{}", pid, id));
        std::fs::create_dir_all(&path).context("failed to create temp dir")?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

// ── Feature generator ──────────────────────────────────────────────────

/// Deterministic xorshift so runs are comparable.
struct Rng(u64);

impl Rng {
    fn next_f64(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn make_point(id: i64, rng: &mut Rng) -> Feature {
    let lon = -180.0 + rng.next_f64() * 360.0;
    let lat = -85.0 + rng.next_f64() * 170.0;
    let ts = 1_300_000_000 + id;
    let ops = vec![
        Operation::new(id, ElementKind::Point, OperationKind::CreateNode, id % 997, ts, id / 50, 1)
            .with_coordinate(lon, lat),
        Operation::new(id, ElementKind::Point, OperationKind::AddTag, id % 997, ts, id / 50, 1)
            .with_tag("amenity", "bench"),
        Operation::new(id, ElementKind::Point, OperationKind::MoveNode, id % 991, ts + 3600, id / 50 + 1, 2)
            .with_coordinate(lon + 0.0001, lat - 0.0001),
    ];
    Feature::new(id, ElementKind::Point, ops)
}

// ── Run ────────────────────────────────────────────────────────────────

struct RunReport {
    features: usize,
    seconds: f64,
    flushes: u64,
    spilled: u64,
    reloads: u64,
    subdivisions: u64,
    disk_mb: f64,
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() { dir_size(&entry.path())? } else { meta.len() };
    }
    Ok(total)
}

fn run(count: usize, limit_bytes: u64) -> anyhow::Result<RunReport> {
    let dir = TmpDir::new()?;
    let config = StoreConfig {
        node_capacity: 20_000,
        spill: SpillConfig {
            memory_limit_bytes: Some(limit_bytes),
            check_interval_ms: 50,
            ..SpillConfig::default()
        },
        ..StoreConfig::default()
    };

    let start = Instant::now();
    let mut builder = IndexBuilder::open(dir.path(), config)?;
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    let mut batch = Vec::with_capacity(1_000);
    for id in 1..=count as i64 {
        batch.push(make_point(id, &mut rng));
        if batch.len() == 1_000 {
            builder.insert_batch(batch.drain(..))?;
        }
    }
    builder.insert_batch(batch)?;
    let stats = builder.spill_stats().clone();
    let tree = builder.finish()?;
    let seconds = start.elapsed().as_secs_f64();

    let reader = IndexReader::open(dir.path())?;
    let read_back = reader.features(None, None, false).count();
    anyhow::ensure!(read_back == count, "read back {read_back} of {count} features");

    Ok(RunReport {
        features: count,
        seconds,
        flushes: stats.flushes,
        spilled: stats.features_spilled,
        reloads: stats.reloads,
        subdivisions: tree.subdivisions(),
        disk_mb: dir_size(dir.path())? as f64 / (1024.0 * 1024.0),
    })
}

// ── Main ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let max: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("max_features must be an integer")?,
        None => 200_000,
    };

    let baseline = SystemMemoryProbe::new(None).sample().used_bytes;
    let limit = baseline + 64 * 1024 * 1024;

    println!("histdb ingest profile (memory limit {:.0} MB)", limit as f64 / (1024.0 * 1024.0));
    println!("==============================================");
    println!();
    println!(
        "{:<10} {:>8} {:>8} {:>10} {:>8} {:>8} {:>10}",
        "Features", "Secs", "Flushes", "Spilled", "Reloads", "Splits", "Disk (MB)"
    );
    println!("{:-<68}", "");

    let mut size = 10_000;
    while size <= max {
        eprint!("Ingesting {}... ", size);
        let r = run(size, limit)?;
        println!(
            "{:<10} {:>8.2} {:>8} {:>10} {:>8} {:>8} {:>10.1}",
            r.features, r.seconds, r.flushes, r.spilled, r.reloads, r.subdivisions, r.disk_mb
        );
        eprintln!("done");
        size *= 4;
    }
    Ok(())
}
