//! Sharded operation file store.
//!
//! One directory holds, per element kind, a sequence of size-bounded shard
//! files plus an `operationFileList` manifest describing them.

pub mod manifest;
pub mod reader;
pub mod scan;
pub mod writer;

pub use manifest::{shard_file_name, OperationFile, OperationFileManifest, MANIFEST_FILE_NAME};
pub use reader::{open_for_read, plan_files, FeatureReader, IdFilter, ScanStats, ShardFileReader};
pub use scan::{partition_files, prefetch_file, scan_directory, ParallelScan};
pub use writer::{write_features, write_features_by_kind, OperationFileWriter};
