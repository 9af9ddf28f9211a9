//! Process-level registry of open files, keyed by canonical path.
//!
//! Locking is two-level: the table lock guards membership, each file's own
//! lock guards its mappings and counters. When both are needed the table lock
//! is taken first.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{CacheConfig, FileCacheBuilder};
use crate::errors::{FileCacheError, Result};
use crate::handle::{FileEntry, FileStamp, MappedFile};
use crate::utils::sanitize_path;

/// What kind of object a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// A regular file on a filesystem.
    #[default]
    Regular,
    /// A POSIX shared-memory object (`shm_open`), named by the canonical path.
    Shared,
}

pub(crate) struct CacheShared {
    table: Mutex<HashMap<PathBuf, Arc<FileEntry>>>,
    config: CacheConfig,
}

impl CacheShared {
    /// Unlink `entry` once its last reference is gone, unless an `open` revived
    /// it or already replaced it with a fresher entry.
    pub(crate) fn evict_if_unused(&self, entry: &Arc<FileEntry>) {
        let mut table = self.table.lock();
        if entry.state.lock().refcount != 0 {
            return;
        }
        let removed = match table.get(&entry.path) {
            Some(current) if Arc::ptr_eq(current, entry) => table.remove(&entry.path),
            _ => None,
        };
        drop(table);
        if removed.is_some() {
            log::debug!("evicted {:?} from cache", entry.path);
        }
    }
}

impl Drop for CacheShared {
    fn drop(&mut self) {
        for path in self.table.get_mut().keys() {
            log::warn!("file {path:?} still open while its cache shuts down");
        }
    }
}

/// Shared registry of open files.
///
/// Opening the same canonical path twice yields the same underlying handle as
/// long as the file's size, mtime and inode are unchanged; a changed file gets
/// a fresh handle while holders of the old one keep using it undisturbed.
///
/// Cloning a `FileCache` is cheap and yields another view of the same registry.
///
/// # Examples
///
/// ```no_run
/// use mmap_filecache::{AccessRule, FileCache, OpenMode};
///
/// let cache = FileCache::new();
/// let a = cache.open("data.bin", OpenMode::Regular)?;
/// let b = cache.open("./data.bin", OpenMode::Regular)?;
/// assert!(a.same_handle(&b));
/// assert_eq!(a.refcount(), 2);
///
/// let whole = a.map_all(AccessRule::Sequential)?;
/// println!("{} bytes mapped", whole.len());
/// # Ok::<(), mmap_filecache::FileCacheError>(())
/// ```
#[derive(Clone)]
pub struct FileCache {
    shared: Arc<CacheShared>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("open_files", &self.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCache {
    /// Empty cache with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Empty cache with the given configuration.
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                table: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Start configuring a cache.
    #[must_use]
    pub fn builder() -> FileCacheBuilder {
        FileCacheBuilder::new()
    }

    /// Configuration used for every file opened through this cache.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Open `path` read-only, re-using the cached handle when the file is
    /// unchanged on disk.
    ///
    /// # Errors
    ///
    /// Returns `FileCacheError::InvalidArgument` for an empty path,
    /// `FileCacheError::InvalidPath` if the path cannot be made absolute,
    /// `FileCacheError::OpenFailed` if the OS open fails and
    /// `FileCacheError::StatFailed` if the file's metadata cannot be read.
    pub fn open<P: AsRef<Path>>(&self, path: P, mode: OpenMode) -> Result<MappedFile> {
        let path = sanitize_path(path)?;
        let file = open_backing(&path, mode).map_err(|source| FileCacheError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        let meta = file.metadata().map_err(|source| FileCacheError::StatFailed {
            path: path.clone(),
            source,
        })?;
        let stamp = FileStamp::from_metadata(&meta);

        let mut table = self.shared.table.lock();

        if let Some(existing) = table.get(&path) {
            if existing.stamp == stamp {
                existing.state.lock().refcount += 1;
                log::debug!("re-using cached handle for {path:?}");
                // `file` is a duplicate descriptor and is closed on return.
                return Ok(self.handle(Arc::clone(existing)));
            }
        }
        if let Some(stale) = table.remove(&path) {
            stale.state.lock().pending_removal = true;
            log::debug!("{path:?} changed on disk, replacing cached handle");
        }

        let entry = Arc::new(FileEntry::new(
            path.clone(),
            file,
            stamp,
            mode == OpenMode::Shared,
            self.shared.config.clone(),
        ));
        table.insert(path, Arc::clone(&entry));
        log::debug!("opened {:?} ({} bytes)", entry.path, stamp.len);
        Ok(self.handle(entry))
    }

    fn handle(&self, entry: Arc<FileEntry>) -> MappedFile {
        MappedFile {
            entry,
            cache: Arc::downgrade(&self.shared),
        }
    }

    /// Record an I/O fault reported for the page `[addr, addr + page_size)`.
    /// A `page_size` of zero is treated as one byte.
    ///
    /// Meant to be called from whatever receives the OS notification (a
    /// SIGBUS handler, for instance). Scans every open file, whole-file
    /// mapping first, and flags the first mapping the page touches. Cost grows
    /// with open files times live mappings. Handles already replaced by a
    /// fresher open are no longer scanned.
    ///
    /// Returns `true` if a mapping was flagged.
    pub fn report_fault(&self, addr: usize, page_size: usize) -> bool {
        let page_size = page_size.max(1);
        let table = self.shared.table.lock();
        for entry in table.values() {
            if entry.mark_faulty(addr, page_size) {
                log::warn!("I/O fault at {addr:#x} inside a mapping of {:?}", entry.path);
                return true;
            }
        }
        false
    }

    /// Number of files currently in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Whether no file is currently cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.table.lock().is_empty()
    }

    /// Whether a handle for `path` is cached. Unusable paths are never cached.
    #[must_use]
    pub fn contains<P: AsRef<Path>>(&self, path: P) -> bool {
        sanitize_path(path).is_ok_and(|path| self.shared.table.lock().contains_key(&path))
    }

    /// Canonical paths of every cached file, sorted.
    #[must_use]
    pub fn open_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.shared.table.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

fn open_backing(path: &Path, mode: OpenMode) -> io::Result<File> {
    let file = match mode {
        OpenMode::Regular => OpenOptions::new().read(true).open(path)?,
        OpenMode::Shared => open_shared(path)?,
    };
    set_cloexec(&file)?;
    Ok(file)
}

#[cfg(target_os = "linux")]
fn open_shared(path: &Path) -> io::Result<File> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::FromRawFd;

    let name = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0o777 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by shm_open and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn open_shared(_path: &Path) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "shared memory objects are not supported on this platform",
    ))
}

#[cfg(unix)]
fn set_cloexec(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC != 0 {
        return Ok(());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_cloexec(_file: &File) -> io::Result<()> {
    Ok(())
}
