//! High-level API for common file cache tasks.
//!
//! Provides convenience functions that wrap open, map and line iteration.

use std::path::Path;

use crate::advise::AccessRule;
use crate::cache::{FileCache, OpenMode};
use crate::errors::Result;
use crate::handle::MappedFile;

/// Open a regular file through `cache`.
///
/// # Errors
///
/// Returns errors from `FileCache::open`.
pub fn open_file<P: AsRef<Path>>(cache: &FileCache, path: P) -> Result<MappedFile> {
    cache.open(path, OpenMode::Regular)
}

/// Open a POSIX shared-memory object through `cache`.
///
/// # Errors
///
/// Returns errors from `FileCache::open`.
pub fn open_shared<P: AsRef<Path>>(cache: &FileCache, name: P) -> Result<MappedFile> {
    cache.open(name, OpenMode::Shared)
}

/// Copy `[offset, offset + len)` of `file` out of a shared mapping.
///
/// # Errors
///
/// Returns errors from `MappedFile::map_new`, or `FileCacheError::AlreadyFaulted`
/// if the mapping was reported faulty.
pub fn read_region(file: &MappedFile, offset: u64, len: u64) -> Result<Vec<u8>> {
    let region = file.map_new(AccessRule::Random, offset, len)?;
    region.verify()?;
    Ok(region.to_vec())
}

/// Open `path` and feed each line to `f` as `(index, content)`.
/// Returns the number of lines visited. Empty files have no lines.
///
/// # Errors
///
/// Returns errors from `FileCache::open` or `MappedFile::lines`.
pub fn map_file_lines<P, F>(cache: &FileCache, path: P, mut f: F) -> Result<usize>
where
    P: AsRef<Path>,
    F: FnMut(usize, &[u8]),
{
    let file = open_file(cache, path)?;
    if file.is_empty() {
        return Ok(0);
    }
    let mut count = 0;
    file.lines()?.for_each_line(|line, bytes| {
        count += 1;
        f(line.index(), bytes);
        Ok::<(), std::convert::Infallible>(())
    })
    .unwrap_or_else(|never| match never {});
    Ok(count)
}

#[cfg(feature = "async")]
pub mod r#async {
    //! Async helpers (Tokio) that keep blocking open and map calls off the executor.
    use std::io;
    use std::path::Path;

    use crate::cache::{FileCache, OpenMode};
    use crate::errors::{FileCacheError, Result};
    use crate::handle::MappedFile;

    /// Open `path` on Tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// Returns errors from `FileCache::open`; a failed blocking task surfaces
    /// as `FileCacheError::OpenFailed`.
    pub async fn open_async<P: AsRef<Path>>(cache: &FileCache, path: P, mode: OpenMode) -> Result<MappedFile> {
        let cache = cache.clone();
        let path = path.as_ref().to_path_buf();
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || cache.open(task_path, mode))
            .await
            .map_err(|err| FileCacheError::OpenFailed {
                path,
                source: io::Error::other(err),
            })?
    }

    /// Copy a range of `file` on Tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// Returns errors from [`read_region`](super::read_region); a failed
    /// blocking task surfaces as `FileCacheError::MapFailed`.
    pub async fn read_region_async(file: &MappedFile, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file = file.clone();
        tokio::task::spawn_blocking(move || super::read_region(&file, offset, len))
            .await
            .map_err(|err| FileCacheError::MapFailed {
                offset,
                len,
                source: io::Error::other(err),
            })?
    }
}
