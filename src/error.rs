//! Error types for the operation store

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt frame in {path} at byte {offset}: {reason}")]
    CorruptFrame {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("Shard file {file} listed in manifest of {dir} is missing")]
    MissingShard { dir: PathBuf, file: String },

    #[error("Inconsistent {path}: expected {expected}, found {found}")]
    Inconsistent {
        path: String,
        expected: u64,
        found: u64,
    },

    #[error("Scan worker failed: {0}")]
    ScanWorker(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Stable error class code for callers that log or count failures.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::CorruptFrame { .. }
            | StoreError::InvalidFormat(_)
            | StoreError::InvalidManifest { .. }
            | StoreError::Json(_) => "FORMAT_ERROR",
            StoreError::ManifestNotFound(_)
            | StoreError::MissingShard { .. }
            | StoreError::Inconsistent { .. } => "CONSISTENCY_ERROR",
            StoreError::ScanWorker(_) => "RESOURCE_ERROR",
            StoreError::InvalidConfig(_) => "CONFIG_ERROR",
            StoreError::Io(_) => "IO_ERROR",
        }
    }
}

/// Decode failure inside a byte buffer, before a file path is known.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("at byte {offset}: {reason}")]
pub struct FrameError {
    pub offset: u64,
    pub reason: String,
}

impl FrameError {
    pub fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset: offset as u64,
            reason: reason.into(),
        }
    }

    /// Attach the shard file path.
    pub fn in_file(self, path: impl Into<PathBuf>) -> StoreError {
        StoreError::CorruptFrame {
            path: path.into(),
            offset: self.offset,
            reason: self.reason,
        }
    }
}

impl From<FrameError> for StoreError {
    fn from(e: FrameError) -> Self {
        StoreError::InvalidFormat(e.to_string())
    }
}
