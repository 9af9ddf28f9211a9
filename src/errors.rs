//! Crate-specific error types for mmap-filecache.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for file cache operations.
pub type Result<T> = std::result::Result<T, FileCacheError>;

/// Error type covering path, open, metadata, bounds and mapping failures.
#[derive(Debug, Error)]
pub enum FileCacheError {
    /// A required argument was empty or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The path could not be turned into a canonical absolute path.
    #[error("invalid path {path:?}: {source}")]
    InvalidPath {
        /// Path as given by the caller.
        path: PathBuf,
        /// Underlying cause (usually the working directory lookup).
        #[source]
        source: io::Error,
    },

    /// Opening the file or shared-memory object failed.
    #[error("failed to open {path:?}: {source}")]
    OpenFailed {
        /// Canonical path that was opened.
        path: PathBuf,
        /// OS error reported by the open call.
        #[source]
        source: io::Error,
    },

    /// Retrieving size, mtime or inode of the opened file failed.
    #[error("failed to stat {path:?}: {source}")]
    StatFailed {
        /// Canonical path of the file.
        path: PathBuf,
        /// OS error reported by the metadata call.
        #[source]
        source: io::Error,
    },

    /// Requested mapping range lies outside the file.
    #[error("range out of bounds: offset={offset}, len={len}, total={total}")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Length of the file.
        total: u64,
    },

    /// The OS refused to map the range, even after dropping huge pages.
    #[error("mapping failed: offset={offset}, len={len}: {source}")]
    MapFailed {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// OS error reported by the mapping call.
        #[source]
        source: io::Error,
    },

    /// An I/O fault was recorded inside this mapping; its contents are unreliable.
    #[error("mapped region faulted: offset={offset}, len={len}")]
    AlreadyFaulted {
        /// Offset of the faulted mapping.
        offset: u64,
        /// Length of the faulted mapping.
        len: u64,
    },
}
