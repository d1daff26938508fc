//! Read-side of the sharded operation file store.
//!
//! Read path: manifest -> id-range pruning (no I/O for skipped files) ->
//! mmap each selected shard -> decode frames -> group operations into
//! features -> merge against the wanted-id set.
//!
//! Both the decoded stream (for files appended in id order) and the wanted
//! ids are ascending, so a single cursor walks the filter; once it passes
//! the file's max id the rest of the file is abandoned.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::codec::{DeltaState, FrameReader};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::model::{ElementKind, Feature, Operation};
use crate::store::manifest::{OperationFile, OperationFileManifest};

// ── Id Filter ───────────────────────────────────────────────────────

/// Sorted, de-duplicated set of wanted entity ids. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdFilter {
    ids: Arc<[i64]>,
}

impl IdFilter {
    pub fn new(mut ids: Vec<i64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids: ids.into() }
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.binary_search(&id).is_ok()
    }
}

impl FromIterator<i64> for IdFilter {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ── Scan Stats ──────────────────────────────────────────────────────

/// Counters for one read. Lookup misses are reported here, never as errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_listed: usize,
    pub files_skipped_range: usize,
    pub files_skipped_constrained: usize,
    pub files_read: usize,
    pub files_abandoned_early: usize,
    pub features_matched: u64,
    pub features_discarded: u64,
    pub ids_not_found: u64,
}

impl ScanStats {
    pub fn merge(&mut self, other: &ScanStats) {
        self.files_listed += other.files_listed;
        self.files_skipped_range += other.files_skipped_range;
        self.files_skipped_constrained += other.files_skipped_constrained;
        self.files_read += other.files_read;
        self.files_abandoned_early += other.files_abandoned_early;
        self.features_matched += other.features_matched;
        self.features_discarded += other.features_discarded;
        self.ids_not_found += other.ids_not_found;
    }
}

// ── File Planning ───────────────────────────────────────────────────

/// Select the files of `kind` worth opening.
///
/// With a filter, files whose [min, max] id range holds no wanted id are
/// skipped. `constrained_min` additionally skips files with fewer wanted
/// ids than the threshold; it trades completeness for throughput and must
/// not be used when every match is required.
pub fn plan_files(
    manifest: &OperationFileManifest,
    kind: ElementKind,
    filter: Option<&IdFilter>,
    constrained_min: Option<usize>,
    stats: &mut ScanStats,
) -> Vec<OperationFile> {
    let mut selected = Vec::new();
    for file in manifest.files(kind) {
        stats.files_listed += 1;
        if file.is_empty() {
            stats.files_skipped_range += 1;
            continue;
        }
        if let Some(filter) = filter {
            let overlap = file.overlap(filter.ids());
            if overlap == 0 {
                tracing::debug!(file = %file.file_name(), min = file.min_id, max = file.max_id, "skip shard: no id overlap");
                stats.files_skipped_range += 1;
                continue;
            }
            if let Some(min) = constrained_min {
                if overlap < min {
                    tracing::debug!(file = %file.file_name(), overlap, min, "skip shard: below constrained threshold");
                    stats.files_skipped_constrained += 1;
                    continue;
                }
            }
        }
        selected.push(file.clone());
    }
    selected
}

// ── Shard File Reader ───────────────────────────────────────────────

/// Decodes one shard file into features, in file order.
pub struct ShardFileReader {
    path: PathBuf,
    meta: OperationFile,
    data: Option<Mmap>,
    pos: usize,
    state: DeltaState,
    decoded: std::vec::IntoIter<Operation>,
    pending: Vec<Operation>,
    ops_seen: u64,
}

impl ShardFileReader {
    pub fn open(dir: &Path, meta: OperationFile) -> Result<Self> {
        let path = dir.join(meta.file_name());
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingShard {
                    dir: dir.to_path_buf(),
                    file: meta.file_name(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        // Zero-length files cannot be mapped.
        let data = if file.metadata()?.len() == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }.map_err(StoreError::Io)?)
        };
        Ok(Self {
            path,
            meta,
            data,
            pos: 0,
            state: DeltaState::reset(),
            decoded: Vec::new().into_iter(),
            pending: Vec::new(),
            ops_seen: 0,
        })
    }

    pub fn meta(&self) -> &OperationFile {
        &self.meta
    }

    /// Decode the next frame into `self.decoded`. Returns false at EOF.
    ///
    /// The delta state is only committed once the whole frame decoded.
    fn load_frame(&mut self) -> Result<bool> {
        let data = self.data.as_deref().unwrap_or(&[]);
        let mut frames = FrameReader::at(data, self.pos);
        let mut state = self.state;
        let decoded = match frames.next() {
            None => return Ok(false),
            Some(frame) => frame
                .and_then(|frame| frame.decode(&mut state))
                .map(|ops| (ops, frames.position())),
        };
        match decoded {
            Err(e) => {
                tracing::error!(path = %self.path.display(), offset = e.offset, reason = %e.reason, "corrupt shard frame");
                Err(e.in_file(&self.path))
            }
            Ok((ops, next)) => {
                self.state = state;
                self.ops_seen += ops.len() as u64;
                self.decoded = ops.into_iter();
                self.pos = next;
                Ok(true)
            }
        }
    }

    /// Next complete feature, or None at end of file.
    pub fn next_feature(&mut self) -> Result<Option<Feature>> {
        loop {
            if let Some(op) = self.decoded.next() {
                let boundary = self
                    .pending
                    .first()
                    .is_some_and(|first| first.entity_id != op.entity_id);
                if boundary {
                    let ops = std::mem::replace(&mut self.pending, vec![op]);
                    return Ok(Some(self.assemble(ops)));
                }
                self.pending.push(op);
                continue;
            }
            if !self.load_frame()? {
                if self.ops_seen != self.meta.entry_count {
                    tracing::error!(path = %self.path.display(), expected = self.meta.entry_count, found = self.ops_seen, "shard shorter than manifest");
                    return Err(StoreError::Inconsistent {
                        path: self.path.display().to_string(),
                        expected: self.meta.entry_count,
                        found: self.ops_seen,
                    });
                }
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let ops = std::mem::take(&mut self.pending);
                return Ok(Some(self.assemble(ops)));
            }
        }
    }

    fn assemble(&self, ops: Vec<Operation>) -> Feature {
        let id = ops[0].entity_id;
        Feature::from_sorted(id, self.meta.kind, ops)
    }
}

// ── Feature Reader ──────────────────────────────────────────────────

/// Streams features of one kind from one directory, optionally filtered.
pub struct FeatureReader {
    dir: PathBuf,
    files: VecDeque<OperationFile>,
    filter: Option<IdFilter>,
    /// Wanted ids that were returned, parallel to the filter.
    found: Vec<bool>,
    current: Option<ActiveFile>,
    stats: ScanStats,
    finished: bool,
}

struct ActiveFile {
    reader: ShardFileReader,
    /// Merge cursor into the filter.
    cursor: usize,
    /// End of the filter range that can occur in this file.
    end: usize,
}

/// Open `dir` for reading features of `kind`.
///
/// A missing manifest is an error. `constrained` applies the per-kind
/// throughput threshold from `config` (only meaningful with a filter).
pub fn open_for_read(
    dir: &Path,
    kind: ElementKind,
    filter: Option<IdFilter>,
    constrained: bool,
    config: &StoreConfig,
) -> Result<FeatureReader> {
    let manifest = OperationFileManifest::read_from(dir)?;
    let mut stats = ScanStats::default();
    let constrained_min = constrained.then(|| config.constrained_threshold(kind));
    let files = plan_files(&manifest, kind, filter.as_ref(), constrained_min, &mut stats);
    let mut reader = FeatureReader::for_files(dir, files, filter)?;
    reader.stats.merge(&stats);
    Ok(reader)
}

impl FeatureReader {
    /// Read an explicit list of files (already planned) from `dir`.
    ///
    /// Every listed shard must exist; this is checked before any decoding.
    pub fn for_files(dir: &Path, files: Vec<OperationFile>, filter: Option<IdFilter>) -> Result<Self> {
        for file in &files {
            if !dir.join(file.file_name()).exists() {
                tracing::error!(dir = %dir.display(), file = %file.file_name(), "shard listed in manifest is missing");
                return Err(StoreError::MissingShard {
                    dir: dir.to_path_buf(),
                    file: file.file_name(),
                });
            }
        }
        let found = filter.as_ref().map_or_else(Vec::new, |f| vec![false; f.len()]);
        Ok(Self {
            dir: dir.to_path_buf(),
            files: files.into(),
            filter,
            found,
            current: None,
            stats: ScanStats::default(),
            finished: false,
        })
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    fn open_next(&mut self) -> Result<bool> {
        let Some(meta) = self.files.pop_front() else {
            return Ok(false);
        };
        let (cursor, end) = match &self.filter {
            Some(f) => (
                f.ids().partition_point(|&id| id < meta.min_id),
                f.ids().partition_point(|&id| id <= meta.max_id),
            ),
            None => (0, 0),
        };
        let reader = ShardFileReader::open(&self.dir, meta)?;
        self.stats.files_read += 1;
        self.current = Some(ActiveFile { reader, cursor, end });
        Ok(true)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.stats.ids_not_found = self.found.iter().filter(|&&f| !f).count() as u64;
        tracing::debug!(dir = %self.dir.display(), stats = ?self.stats, "feature read finished");
    }

    /// Pull the next matching feature.
    pub fn next_feature(&mut self) -> Result<Option<Feature>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.current.is_none() && !self.open_next()? {
                self.finish();
                return Ok(None);
            }
            let Some(active) = self.current.as_mut() else {
                continue;
            };

            let Some(filter) = &self.filter else {
                match active.reader.next_feature()? {
                    Some(feature) => {
                        self.stats.features_matched += 1;
                        return Ok(Some(feature));
                    }
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            };

            let ids = filter.ids();
            if active.reader.meta().sorted && active.cursor >= active.end {
                // Every remaining wanted id lies beyond this file's max id.
                self.stats.files_abandoned_early += 1;
                self.current = None;
                continue;
            }
            let Some(feature) = active.reader.next_feature()? else {
                self.current = None;
                continue;
            };
            let id = feature.id();
            let hit = if active.reader.meta().sorted {
                while active.cursor < active.end && ids[active.cursor] < id {
                    active.cursor += 1;
                }
                let hit = active.cursor < active.end && ids[active.cursor] == id;
                if hit {
                    self.found[active.cursor] = true;
                    active.cursor += 1;
                }
                hit
            } else {
                let lo = ids.partition_point(|&w| w < active.reader.meta().min_id);
                match ids[lo..active.end].binary_search(&id) {
                    Ok(i) => {
                        self.found[lo + i] = true;
                        true
                    }
                    Err(_) => false,
                }
            };
            if hit {
                self.stats.features_matched += 1;
                return Ok(Some(feature));
            }
            self.stats.features_discarded += 1;
        }
    }
}

impl Iterator for FeatureReader {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_feature() {
            Ok(Some(f)) => Some(Ok(f)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
