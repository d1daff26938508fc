//! Per-directory manifest of operation shard files.
//!
//! Each quadtree node directory holds one `operationFileList` document
//! listing its shard files per element kind. Every entry carries the
//! entity id range seen in the file (for pruning without opening it) and
//! the delta state at the end of the file (for resuming appends).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::DeltaState;
use crate::error::{Result, StoreError};
use crate::model::ElementKind;

pub const MANIFEST_FILE_NAME: &str = "operationFileList";

/// Shard file name for a kind and id, e.g. `operation_w_1`.
pub fn shard_file_name(kind: ElementKind, file_id: u32) -> String {
    format!("operation_{}_{}", kind.file_prefix(), file_id)
}

/// Metadata for one shard file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFile {
    pub file_id: u32,
    pub kind: ElementKind,
    /// Operations written to the file.
    pub entry_count: u64,
    /// Features written to the file.
    pub feature_count: u64,
    /// Smallest entity id written; meaningless while `entry_count == 0`.
    pub min_id: i64,
    pub max_id: i64,
    /// True while every feature was appended in ascending id order.
    pub sorted: bool,
    /// Delta state after the last written operation.
    pub continuation: DeltaState,
}

impl OperationFile {
    pub fn new(file_id: u32, kind: ElementKind) -> Self {
        Self {
            file_id,
            kind,
            entry_count: 0,
            feature_count: 0,
            min_id: 0,
            max_id: 0,
            sorted: true,
            continuation: DeltaState::reset(),
        }
    }

    pub fn file_name(&self) -> String {
        shard_file_name(self.kind, self.file_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Account for one feature of `ops` operations appended to the file.
    pub fn record_feature(&mut self, id: i64, ops: u64) {
        if self.feature_count == 0 {
            self.min_id = id;
            self.max_id = id;
        } else {
            if id <= self.max_id {
                self.sorted = false;
            }
            self.min_id = self.min_id.min(id);
            self.max_id = self.max_id.max(id);
        }
        self.feature_count += 1;
        self.entry_count += ops;
    }

    /// Number of ids in the sorted `wanted` slice inside `[min_id, max_id]`.
    pub fn overlap(&self, wanted: &[i64]) -> usize {
        if self.is_empty() {
            return 0;
        }
        let lo = wanted.partition_point(|&id| id < self.min_id);
        let hi = wanted.partition_point(|&id| id <= self.max_id);
        hi.saturating_sub(lo)
    }
}

/// Shard files of one directory, per element kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFileManifest {
    pub points: Vec<OperationFile>,
    pub lines: Vec<OperationFile>,
    pub relations: Vec<OperationFile>,
}

impl OperationFileManifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).exists()
    }

    pub fn files(&self, kind: ElementKind) -> &[OperationFile] {
        match kind {
            ElementKind::Point => &self.points,
            ElementKind::Line => &self.lines,
            ElementKind::Relation => &self.relations,
        }
    }

    pub fn files_mut(&mut self, kind: ElementKind) -> &mut Vec<OperationFile> {
        match kind {
            ElementKind::Point => &mut self.points,
            ElementKind::Line => &mut self.lines,
            ElementKind::Relation => &mut self.relations,
        }
    }

    /// Insert or replace the entry with the same file id.
    pub fn upsert(&mut self, file: OperationFile) {
        let files = self.files_mut(file.kind);
        match files.iter_mut().find(|f| f.file_id == file.file_id) {
            Some(existing) => *existing = file,
            None => {
                files.push(file);
                files.sort_by_key(|f| f.file_id);
            }
        }
    }

    pub fn next_file_id(&self, kind: ElementKind) -> u32 {
        self.files(kind).iter().map(|f| f.file_id + 1).max().unwrap_or(0)
    }

    pub fn total_features(&self) -> u64 {
        ElementKind::ALL
            .iter()
            .flat_map(|&k| self.files(k))
            .map(|f| f.feature_count)
            .sum()
    }

    pub fn total_entries(&self) -> u64 {
        ElementKind::ALL
            .iter()
            .flat_map(|&k| self.files(k))
            .map(|f| f.entry_count)
            .sum()
    }

    /// Load the manifest of `dir`; a missing manifest is an error.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ManifestNotFound(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: Self = serde_json::from_str(&contents).map_err(|e| StoreError::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        manifest.validate(&path)?;
        Ok(manifest)
    }

    /// Load the manifest of `dir`, or an empty one if none was written yet.
    pub fn read_or_default(dir: &Path) -> Result<Self> {
        match Self::read_from(dir) {
            Err(StoreError::ManifestNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Atomic write: temp file + rename.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path(dir);
        let tmp = dir.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for kind in ElementKind::ALL {
            let files = self.files(kind);
            if let Some(f) = files.iter().find(|f| f.kind != kind) {
                return Err(StoreError::InvalidManifest {
                    path: path.to_path_buf(),
                    reason: format!("file {} listed under {:?}", f.file_name(), kind),
                });
            }
            if files.windows(2).any(|w| w[0].file_id >= w[1].file_id) {
                return Err(StoreError::InvalidManifest {
                    path: path.to_path_buf(),
                    reason: format!("{kind:?} file ids not strictly ascending"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_overlap_counts_ids_in_range() {
        let mut f = OperationFile::new(0, ElementKind::Point);
        assert_eq!(f.overlap(&[1, 2, 3]), 0, "empty file overlaps nothing");
        f.record_feature(50, 3);
        f.record_feature(500, 1);
        assert_eq!(f.overlap(&[10, 20]), 0);
        assert_eq!(f.overlap(&[10, 50, 100, 500, 501]), 3);
        assert_eq!(f.overlap(&[]), 0);
    }

    #[test]
    fn test_record_feature_tracks_sortedness() {
        let mut f = OperationFile::new(0, ElementKind::Line);
        f.record_feature(10, 2);
        f.record_feature(20, 2);
        assert!(f.sorted);
        f.record_feature(15, 1);
        assert!(!f.sorted);
        assert_eq!((f.min_id, f.max_id, f.entry_count, f.feature_count), (10, 20, 5, 3));
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            OperationFileManifest::read_from(dir.path()),
            Err(StoreError::ManifestNotFound(_))
        ));
        assert_eq!(
            OperationFileManifest::read_or_default(dir.path()).unwrap(),
            OperationFileManifest::default()
        );
    }

    #[test]
    fn test_manifest_round_trips_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let mut m = OperationFileManifest::default();
        let mut f = OperationFile::new(0, ElementKind::Relation);
        f.record_feature(7, 4);
        f.continuation.entity_id = 7;
        m.upsert(f);
        m.upsert(OperationFile::new(1, ElementKind::Relation));
        m.write_to(dir.path()).unwrap();
        let first = std::fs::read(OperationFileManifest::path(dir.path())).unwrap();

        let loaded = OperationFileManifest::read_from(dir.path()).unwrap();
        assert_eq!(loaded, m);
        assert_eq!(loaded.next_file_id(ElementKind::Relation), 2);
        assert_eq!(loaded.next_file_id(ElementKind::Point), 0);
        loaded.write_to(dir.path()).unwrap();
        assert_eq!(std::fs::read(OperationFileManifest::path(dir.path())).unwrap(), first);
    }

    #[test]
    fn test_corrupt_manifest_reports_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(OperationFileManifest::path(dir.path()), b"{not json").unwrap();
        let err = OperationFileManifest::read_from(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidManifest { .. }));
        assert_eq!(err.code(), "FORMAT_ERROR");
    }
}
