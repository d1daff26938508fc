//! Append-side of the sharded operation file store.
//!
//! Write path: features -> sort by id -> delta frames -> current shard file.
//! A shard rolls over to a fresh file id (and a reset delta state) once it
//! holds `rollover_entries` operations. Features are never split across
//! files. Reopening a directory resumes the last file from the delta state
//! saved in the manifest, without re-reading the file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::{encode_frame, DeltaState};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::model::{ElementKind, Feature, Operation};
use crate::store::manifest::{OperationFile, OperationFileManifest};

/// Appends features of one element kind to one directory.
pub struct OperationFileWriter {
    dir: PathBuf,
    kind: ElementKind,
    rollover_entries: u64,
    ops_per_frame: usize,
    /// File currently receiving appends. Its `continuation` is the live
    /// delta state, updated as each frame is encoded.
    current: OperationFile,
    /// Opened lazily so a rollover at the very end leaves no empty file.
    out: Option<BufWriter<File>>,
    /// Operations not yet framed.
    pending: Vec<Operation>,
    /// Files finished during this session.
    closed: Vec<OperationFile>,
    /// Whether `current` already existed before this session.
    resumed: bool,
    frame_buf: Vec<u8>,
}

impl OperationFileWriter {
    /// Open `dir` for appending features of `kind`.
    ///
    /// Resumes the newest file for the kind when it is below the rollover
    /// limit; otherwise starts the next file id.
    pub fn open_for_append(dir: &Path, kind: ElementKind, config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let manifest = OperationFileManifest::read_or_default(dir)?;

        let last = manifest.files(kind).last().cloned();
        let (current, resumed) = match last {
            Some(file) if file.entry_count < config.rollover_entries => {
                let path = dir.join(file.file_name());
                if !path.exists() {
                    tracing::error!(dir = %dir.display(), file = %file.file_name(), "shard listed in manifest is missing");
                    return Err(StoreError::MissingShard {
                        dir: dir.to_path_buf(),
                        file: file.file_name(),
                    });
                }
                tracing::debug!(dir = %dir.display(), file_id = file.file_id, entries = file.entry_count, "resuming shard");
                (file, true)
            }
            _ => (OperationFile::new(manifest.next_file_id(kind), kind), false),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            kind,
            rollover_entries: config.rollover_entries,
            ops_per_frame: config.ops_per_frame.clamp(1, u16::MAX as usize),
            current,
            out: None,
            pending: Vec::new(),
            closed: Vec::new(),
            resumed,
            frame_buf: Vec::new(),
        })
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Append features, grouped by owner and ordered by entity id.
    pub fn write<'a, I>(&mut self, features: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Feature>,
    {
        let mut ordered: Vec<&Feature> = features.into_iter().collect();
        ordered.sort_by_key(|f| f.id());

        for feature in ordered {
            if feature.kind() != self.kind {
                return Err(StoreError::InvalidFormat(format!(
                    "feature {} is {:?}, writer accepts {:?}",
                    feature.id(),
                    feature.kind(),
                    self.kind
                )));
            }
            if feature.is_empty() {
                continue;
            }
            for op in feature.operations() {
                self.pending.push(op.clone());
                if self.pending.len() >= self.ops_per_frame {
                    self.flush_frame()?;
                }
            }
            self.current.record_feature(feature.id(), feature.len() as u64);

            if self.current.entry_count >= self.rollover_entries {
                self.roll_over()?;
            }
        }
        Ok(())
    }

    /// Flush everything and record the touched files in the manifest.
    ///
    /// Returns the manifest as written.
    pub fn close(mut self) -> Result<OperationFileManifest> {
        self.flush_frame()?;
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        if !self.current.is_empty() || self.resumed {
            self.closed.push(self.current.clone());
        }

        // Re-read: writers for other kinds may have updated the same
        // manifest since this writer was opened.
        let mut manifest = OperationFileManifest::read_or_default(&self.dir)?;
        for file in self.closed.drain(..) {
            manifest.upsert(file);
        }
        manifest.write_to(&self.dir)?;
        Ok(manifest)
    }

    fn flush_frame(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.frame_buf.clear();
        encode_frame(
            self.kind,
            &self.pending,
            &mut self.current.continuation,
            &mut self.frame_buf,
        );
        self.pending.clear();
        if self.out.is_none() {
            let path = self.dir.join(self.current.file_name());
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.out = Some(BufWriter::new(file));
        }
        if let Some(out) = self.out.as_mut() {
            out.write_all(&self.frame_buf)?;
        }
        Ok(())
    }

    fn roll_over(&mut self) -> Result<()> {
        self.flush_frame()?;
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        let next_id = self.current.file_id + 1;
        tracing::debug!(
            dir = %self.dir.display(),
            file_id = self.current.file_id,
            entries = self.current.entry_count,
            "shard rollover"
        );
        let finished = std::mem::replace(&mut self.current, OperationFile::new(next_id, self.kind));
        debug_assert_eq!(self.current.continuation, DeltaState::reset());
        self.closed.push(finished);
        self.resumed = false;
        Ok(())
    }
}

/// Append features of any kinds to `dir`, one writer per kind present.
pub fn write_features(dir: &Path, features: &[Feature], config: &StoreConfig) -> Result<()> {
    write_features_by_kind(dir, features, config).1
}

/// Like [`write_features`], also returning the kinds whose manifest
/// entries were committed before the first failure. Kinds are written in
/// [`ElementKind::ALL`] order and writing stops at the first error.
pub fn write_features_by_kind(
    dir: &Path,
    features: &[Feature],
    config: &StoreConfig,
) -> (Vec<ElementKind>, Result<()>) {
    let mut committed = Vec::new();
    for kind in ElementKind::ALL {
        let of_kind: Vec<&Feature> = features.iter().filter(|f| f.kind() == kind).collect();
        if of_kind.is_empty() {
            continue;
        }
        let written = OperationFileWriter::open_for_append(dir, kind, config).and_then(|mut writer| {
            writer.write(of_kind)?;
            writer.close()
        });
        if let Err(e) = written {
            return (committed, Err(e));
        }
        committed.push(kind);
    }
    (committed, Ok(()))
}
