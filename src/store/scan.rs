//! Partitioned parallel scan over one directory.
//!
//! The file list of every element kind is cut into N contiguous, roughly
//! equal slices; worker N reads slice N of each kind. Workers push decoded
//! features into a bounded queue and a single consumer drains it in
//! fixed-size batches. A full queue blocks producers (short retry loop).
//!
//! Worker failures travel through the queue as errors and panics surface
//! on join, so an incomplete scan is never mistaken for a finished one.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::model::{ElementKind, Feature};
use crate::store::manifest::{OperationFile, OperationFileManifest};
use crate::store::reader::{plan_files, FeatureReader, IdFilter, ScanStats};

/// Split `count` items into at most `n` contiguous ranges whose lengths
/// differ by at most one. Empty ranges are not returned.
pub fn partition_files(count: usize, n: usize) -> Vec<Range<usize>> {
    let n = n.max(1).min(count.max(1));
    let base = count / n;
    let extra = count % n;
    let mut ranges = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Hint the kernel that `path` will be read soon. Best-effort.
#[cfg(target_os = "linux")]
pub fn prefetch_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let file = std::fs::File::open(path)?;
    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_WILLNEED) };
    if ret != 0 {
        return Err(std::io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn prefetch_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

enum Message {
    Feature(Feature),
    Done(ScanStats),
}

/// Work assigned to one worker: per kind, a contiguous slice of files.
struct WorkerPlan {
    slices: Vec<Vec<OperationFile>>,
}

/// Running multi-threaded scan. Drain with [`ParallelScan::next_batch`].
pub struct ParallelScan {
    rx: Receiver<Result<Message>>,
    handles: Vec<JoinHandle<()>>,
    batch_size: usize,
    poll_interval: Duration,
    stats: ScanStats,
    /// Wanted ids seen so far, across every worker and kind.
    filter: Option<IdFilter>,
    found: Vec<bool>,
    failed: bool,
    complete: bool,
}

impl ParallelScan {
    /// Start scanning every element kind in `dir`.
    pub fn start(dir: &Path, filter: Option<IdFilter>, config: &StoreConfig) -> Result<Self> {
        Self::start_kinds(dir, &ElementKind::ALL, filter, config)
    }

    /// Start scanning the given kinds in `dir`.
    pub fn start_kinds(
        dir: &Path,
        kinds: &[ElementKind],
        filter: Option<IdFilter>,
        config: &StoreConfig,
    ) -> Result<Self> {
        let manifest = OperationFileManifest::read_from(dir)?;
        let scan = &config.scan;
        let mut stats = ScanStats::default();

        let workers = scan.workers.max(1);
        let mut plans: Vec<WorkerPlan> = (0..workers).map(|_| WorkerPlan { slices: Vec::new() }).collect();
        for &kind in kinds {
            let files = plan_files(&manifest, kind, filter.as_ref(), None, &mut stats);
            for file in &files {
                let path = dir.join(file.file_name());
                if !path.exists() {
                    tracing::error!(dir = %dir.display(), file = %file.file_name(), "shard listed in manifest is missing");
                    return Err(StoreError::MissingShard {
                        dir: dir.to_path_buf(),
                        file: file.file_name(),
                    });
                }
                prefetch_file(&path).ok();
            }
            for (worker, range) in partition_files(files.len(), workers).into_iter().enumerate() {
                plans[worker].slices.push(files[range].to_vec());
            }
        }
        plans.retain(|p| !p.slices.is_empty());

        tracing::debug!(
            dir = %dir.display(),
            workers = plans.len(),
            files = plans.iter().flat_map(|p| &p.slices).map(Vec::len).sum::<usize>(),
            "parallel scan starting"
        );

        let (tx, rx) = bounded(scan.queue_capacity.max(1));
        let mut handles = Vec::with_capacity(plans.len());
        for (i, plan) in plans.into_iter().enumerate() {
            let tx = tx.clone();
            let dir = dir.to_path_buf();
            let filter = filter.clone();
            let retry = scan.offer_retry();
            let handle = std::thread::Builder::new()
                .name(format!("histdb-scan-{i}"))
                .spawn(move || run_worker(dir, plan, filter, tx, retry))?;
            handles.push(handle);
        }
        // Only workers hold senders now; disconnect marks completion.
        drop(tx);

        let found = filter.as_ref().map_or_else(Vec::new, |f| vec![false; f.len()]);
        Ok(Self {
            rx,
            handles,
            batch_size: scan.batch_size.max(1),
            poll_interval: scan.poll_interval(),
            stats,
            filter,
            found,
            failed: false,
            complete: false,
        })
    }

    /// Next batch of up to `batch_size` features, or None once every
    /// worker has finished and the queue is drained.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Feature>>> {
        if self.complete || self.failed {
            return Ok(None);
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(Ok(Message::Feature(f))) => {
                    self.mark_found(f.id());
                    batch.push(f);
                }
                Ok(Ok(Message::Done(stats))) => {
                    // Each worker only sees its own slice; misses are counted here.
                    self.stats.merge(&ScanStats { ids_not_found: 0, ..stats });
                }
                Ok(Err(e)) => {
                    // Remaining workers are reaped on drop.
                    self.failed = true;
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !batch.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.complete = true;
                    self.stats.ids_not_found = self.found.iter().filter(|&&f| !f).count() as u64;
                    self.join_workers()?;
                    tracing::debug!(stats = ?self.stats, "parallel scan complete");
                    break;
                }
            }
        }
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    /// Drain the whole scan into memory.
    pub fn collect_all(mut self) -> Result<Vec<Feature>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch()? {
            all.extend(batch);
        }
        Ok(all)
    }

    /// Counters merged from finished workers.
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    fn mark_found(&mut self, id: i64) {
        if let Some(filter) = &self.filter {
            if let Ok(i) = filter.ids().binary_search(&id) {
                self.found[i] = true;
            }
        }
    }

    fn join_workers(&mut self) -> Result<()> {
        let mut panicked = Vec::new();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("scan worker").to_string();
            if handle.join().is_err() {
                panicked.push(name);
            }
        }
        if panicked.is_empty() {
            Ok(())
        } else {
            tracing::error!(workers = ?panicked, "scan worker panicked");
            Err(StoreError::ScanWorker(format!("{} panicked", panicked.join(", "))))
        }
    }
}

impl Drop for ParallelScan {
    fn drop(&mut self) {
        // Keep draining so producers blocked on a full queue can exit.
        for handle in self.handles.drain(..) {
            while !handle.is_finished() {
                while self.rx.try_recv().is_ok() {}
                std::thread::sleep(Duration::from_millis(1));
            }
            handle.join().ok();
        }
    }
}

fn run_worker(
    dir: PathBuf,
    plan: WorkerPlan,
    filter: Option<IdFilter>,
    tx: Sender<Result<Message>>,
    retry: Duration,
) {
    let mut stats = ScanStats::default();
    for files in plan.slices {
        let mut reader = match FeatureReader::for_files(&dir, files, filter.clone()) {
            Ok(r) => r,
            Err(e) => {
                offer(&tx, Err(e), retry);
                return;
            }
        };
        loop {
            match reader.next_feature() {
                Ok(Some(feature)) => {
                    if !offer(&tx, Ok(Message::Feature(feature)), retry) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    offer(&tx, Err(e), retry);
                    return;
                }
            }
        }
        stats.merge(reader.stats());
    }
    offer(&tx, Ok(Message::Done(stats)), retry);
}

/// Blocking offer with a short retry loop. False once the consumer is gone.
fn offer(tx: &Sender<Result<Message>>, msg: Result<Message>, retry: Duration) -> bool {
    let mut msg = msg;
    loop {
        match tx.send_timeout(msg, retry) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => msg = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Convenience: scan `dir` with the store's scan settings.
pub fn scan_directory(dir: &Path, filter: Option<IdFilter>, config: &StoreConfig) -> Result<Vec<Feature>> {
    ParallelScan::start(dir, filter, config)?.collect_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::model::{Operation, OperationKind};
    use crate::store::writer::write_features;
    use tempfile::TempDir;

    #[test]
    fn test_partition_is_contiguous_and_balanced() {
        let ranges = partition_files(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(partition_files(2, 8), vec![0..1, 1..2]);
        assert!(partition_files(0, 4).is_empty());
        assert_eq!(partition_files(5, 0), vec![0..5]);
    }

    fn relation(id: i64) -> Feature {
        Feature::new(
            id,
            ElementKind::Relation,
            vec![
                Operation::new(id, ElementKind::Relation, OperationKind::CreateRelation, 2, 50, 3, 1),
                Operation::new(id, ElementKind::Relation, OperationKind::AddMember, 2, 50, 3, 1)
                    .with_reference(id + 1, Some(0)),
            ],
        )
    }

    fn config(workers: usize) -> StoreConfig {
        StoreConfig {
            rollover_entries: 6,
            scan: ScanConfig {
                workers,
                queue_capacity: 2,
                batch_size: 5,
                ..ScanConfig::default()
            },
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_parallel_scan_matches_sequential_read() {
        let dir = TempDir::new().unwrap();
        let config = config(3);
        let features: Vec<Feature> = (1..=40).map(relation).collect();
        write_features(dir.path(), &features, &config).unwrap();

        let mut scan = ParallelScan::start(dir.path(), None, &config).unwrap();
        let mut ids = Vec::new();
        while let Some(batch) = scan.next_batch().unwrap() {
            assert!(batch.len() <= 5);
            ids.extend(batch.iter().map(|f| f.id()));
        }
        ids.sort();
        assert_eq!(ids, (1..=40).collect::<Vec<_>>());
        assert_eq!(scan.stats().files_read, 14);
        assert!(scan.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_filtered_parallel_scan() {
        let dir = TempDir::new().unwrap();
        let config = config(2);
        let features: Vec<Feature> = (1..=20).map(relation).collect();
        write_features(dir.path(), &features, &config).unwrap();

        let filter = IdFilter::new(vec![2, 11, 19, 99]);
        let mut got: Vec<i64> = scan_directory(dir.path(), Some(filter), &config)
            .unwrap()
            .iter()
            .map(Feature::id)
            .collect();
        got.sort();
        assert_eq!(got, vec![2, 11, 19]);
    }

    #[test]
    fn test_missing_ids_counted_once_across_workers() {
        let dir = TempDir::new().unwrap();
        let config = config(3);
        let features: Vec<Feature> = (1..=40).map(relation).collect();
        write_features(dir.path(), &features, &config).unwrap();

        let filter = IdFilter::new(vec![1, 6, 12, 999]);
        let mut scan = ParallelScan::start(dir.path(), Some(filter), &config).unwrap();
        let mut matched = 0;
        while let Some(batch) = scan.next_batch().unwrap() {
            matched += batch.len();
        }
        assert_eq!(matched, 3);
        assert_eq!(scan.stats().ids_not_found, 1);
        assert_eq!(scan.stats().features_matched, 3);
    }

    #[test]
    fn test_worker_error_reaches_consumer() {
        let dir = TempDir::new().unwrap();
        let config = config(2);
        let features: Vec<Feature> = (1..=12).map(relation).collect();
        write_features(dir.path(), &features, &config).unwrap();
        std::fs::write(dir.path().join("operation_r_1"), b"not a frame").unwrap();

        let err = scan_directory(dir.path(), None, &config).unwrap_err();
        assert!(matches!(err, StoreError::CorruptFrame { .. }), "{err}");
    }

    #[test]
    fn test_dropping_unfinished_scan_does_not_hang() {
        let dir = TempDir::new().unwrap();
        let config = config(4);
        let features: Vec<Feature> = (1..=60).map(relation).collect();
        write_features(dir.path(), &features, &config).unwrap();

        let mut scan = ParallelScan::start(dir.path(), None, &config).unwrap();
        assert!(scan.next_batch().unwrap().is_some());
        drop(scan);
    }
}
