//! Reference-counted file handles and the mappings created on them.

use std::fs::{File, Metadata};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::advise::AccessRule;
use crate::cache::CacheShared;
use crate::config::CacheConfig;
use crate::errors::{FileCacheError, Result};
use crate::mmap::{MapAddr, MapRecord};
use crate::region::RegionTable;
use crate::utils::ensure_in_bounds;

/// Identity of the on-disk file captured when it was opened.
///
/// Two opens of the same path share a handle only while all fields agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    /// Size in bytes.
    pub len: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Nanosecond part of the modification time (0 where unavailable).
    pub mtime_nsec: i64,
    /// Inode number (0 where unavailable).
    pub inode: u64,
}

impl FileStamp {
    pub(crate) fn from_metadata(meta: &Metadata) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                use std::os::unix::fs::MetadataExt;
                Self {
                    len: meta.len(),
                    mtime: meta.mtime(),
                    mtime_nsec: meta.mtime_nsec(),
                    inode: meta.ino(),
                }
            } else {
                let since_epoch = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .unwrap_or_default();
                Self {
                    len: meta.len(),
                    mtime: i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX),
                    mtime_nsec: i64::from(since_epoch.subsec_nanos()),
                    inode: 0,
                }
            }
        }
    }
}

/// Snapshot of one live mapping, as reported by [`MappedFile::regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Address the mapping starts at.
    pub addr: MapAddr,
    /// File offset of the first byte.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
    /// Number of holders.
    pub refcount: usize,
    /// Sticky I/O fault flag.
    pub faulty: bool,
    /// Whether the mapping ended up backed by huge pages.
    pub huge_pages: bool,
    /// Most recent access hint.
    pub rule: AccessRule,
    /// Whether this is the shared whole-file mapping.
    pub whole_file: bool,
}

impl RegionInfo {
    fn from_record(record: &MapRecord, whole_file: bool) -> Self {
        Self {
            addr: record.addr(),
            offset: record.offset,
            len: record.len,
            refcount: record.refcount,
            faulty: record.faulty,
            huge_pages: record.huge,
            rule: record.rule,
            whole_file,
        }
    }
}

fn map_failed(offset: u64, len: u64) -> impl FnOnce(std::io::Error) -> FileCacheError {
    move |source| FileCacheError::MapFailed { offset, len, source }
}

/// Everything behind the per-file lock.
#[derive(Debug)]
pub(crate) struct FileState {
    pub(crate) refcount: usize,
    pub(crate) pending_removal: bool,
    whole: Option<MapRecord>,
    regions: RegionTable,
}

/// One opened file, shared by every [`MappedFile`] that refers to it.
#[derive(Debug)]
pub(crate) struct FileEntry {
    pub(crate) path: PathBuf,
    file: File,
    pub(crate) stamp: FileStamp,
    shared: bool,
    config: CacheConfig,
    pub(crate) state: Mutex<FileState>,
}

impl FileEntry {
    /// New entry holding one external reference.
    pub(crate) fn new(path: PathBuf, file: File, stamp: FileStamp, shared: bool, config: CacheConfig) -> Self {
        Self {
            path,
            file,
            stamp,
            shared,
            config,
            state: Mutex::new(FileState {
                refcount: 1,
                pending_removal: false,
                whole: None,
                regions: RegionTable::new(),
            }),
        }
    }

    /// Take a reference on the whole-file mapping, creating it on first use.
    pub(crate) fn acquire_whole(&self, rule: AccessRule) -> Result<(MapAddr, usize)> {
        let len = self.stamp.len;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let whole = match state.whole.take() {
            Some(whole) => whole,
            None => {
                let record = MapRecord::map(&self.file, 0, len, rule, &self.config)
                    .map_err(map_failed(0, len))?;
                log::debug!("mapped {:?} whole ({len} bytes, huge pages: {})", self.path, record.huge);
                record
            }
        };
        let whole = state.whole.insert(whole);
        whole.acquire(rule, &self.config);
        Ok((whole.addr(), whole.byte_len()))
    }

    /// Take a reference on the `[offset, offset + len)` mapping, creating it if needed.
    pub(crate) fn acquire_range(&self, rule: AccessRule, offset: u64, len: u64) -> Result<(MapAddr, usize)> {
        let total = self.stamp.len;
        ensure_in_bounds(offset, len, total)?;
        if offset == 0 && len == total {
            return self.acquire_whole(rule);
        }
        if len == 0 {
            return Err(FileCacheError::InvalidArgument("mapping length must be greater than zero"));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(record) = state
            .regions
            .find_range(offset, len)
            .and_then(|id| state.regions.get_mut(id))
        {
            record.acquire(rule, &self.config);
            return Ok((record.addr(), record.byte_len()));
        }

        let mut record = MapRecord::map(&self.file, offset, len, rule, &self.config)
            .map_err(map_failed(offset, len))?;
        record.acquire(rule, &self.config);
        let mapped = (record.addr(), record.byte_len());
        log::debug!("mapped {:?} [{offset}, +{len}) at {:#x}", self.path, mapped.0.as_usize());
        state.regions.insert(record);
        Ok(mapped)
    }

    /// Drop one reference on the mapping at `addr`. Unknown addresses are ignored.
    pub(crate) fn release(&self, addr: MapAddr) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(whole) = state.whole.as_mut() {
            if whole.addr() == addr {
                if whole.release() {
                    state.whole = None;
                    log::debug!("unmapped {:?} whole", self.path);
                }
                return;
            }
        }

        let Some(id) = state.regions.find_addr(addr) else {
            return;
        };
        let drained = state.regions.get_mut(id).is_some_and(MapRecord::release);
        if drained {
            if let Some(record) = state.regions.remove(id) {
                log::debug!("unmapped {:?} [{}, +{})", self.path, record.offset, record.len);
            }
        }
    }

    pub(crate) fn is_faulted(&self, addr: MapAddr) -> bool {
        let state = self.state.lock();
        match state.whole.as_ref() {
            Some(whole) if whole.addr() == addr => whole.faulty,
            _ => state
                .regions
                .find_addr(addr)
                .and_then(|id| state.regions.get(id))
                .is_some_and(|record| record.faulty),
        }
    }

    /// Flag the first mapping touched by `[addr, addr + page)`. Whole-file map first.
    pub(crate) fn mark_faulty(&self, addr: usize, page: usize) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(whole) = state.whole.as_mut() {
            if whole.contains_fault(addr, page) {
                whole.faulty = true;
                return true;
            }
        }
        if let Some(record) = state.regions.iter_mut().find(|record| record.contains_fault(addr, page)) {
            record.faulty = true;
            return true;
        }
        false
    }

    fn refcount_of(&self, addr: MapAddr) -> usize {
        let state = self.state.lock();
        match state.whole.as_ref() {
            Some(whole) if whole.addr() == addr => whole.refcount,
            _ => state
                .regions
                .find_addr(addr)
                .and_then(|id| state.regions.get(id))
                .map_or(0, |record| record.refcount),
        }
    }
}

impl Drop for FileEntry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let clean = state.regions.is_empty() && state.whole.is_none();
        if !clean {
            let live = state.regions.len() + usize::from(state.whole.is_some());
            log::error!("{:?} destroyed with {live} live mapping(s)", self.path);
        }
        debug_assert!(clean, "file handle destroyed while mappings are alive");
        log::debug!("closed {:?}", self.path);
    }
}

/// An open, read-only file managed by a [`FileCache`](crate::cache::FileCache).
///
/// Every `MappedFile` is one external reference on the shared handle: cloning
/// takes another, dropping (or [`close`](Self::close)) gives one back. When the
/// last one goes, the descriptor is closed and the file leaves the cache.
///
/// # Examples
///
/// ```no_run
/// use mmap_filecache::{AccessRule, FileCache, OpenMode};
///
/// let cache = FileCache::new();
/// let file = cache.open("data.bin", OpenMode::Regular)?;
///
/// // Map bytes 4096..8192 and read them in place.
/// let region = file.map_new(AccessRule::Random, 4096, 4096)?;
/// println!("first byte: {}", region[0]);
///
/// // Dropping the region releases the mapping; dropping `file` closes it.
/// # Ok::<(), mmap_filecache::FileCacheError>(())
/// ```
pub struct MappedFile {
    pub(crate) entry: Arc<FileEntry>,
    pub(crate) cache: Weak<CacheShared>,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.entry.path)
            .field("len", &self.entry.stamp.len)
            .field("shared", &self.entry.shared)
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl Clone for MappedFile {
    fn clone(&self) -> Self {
        self.entry.state.lock().refcount += 1;
        Self {
            entry: Arc::clone(&self.entry),
            cache: Weak::clone(&self.cache),
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let remaining = {
            let mut state = self.entry.state.lock();
            state.refcount = state.refcount.saturating_sub(1);
            state.refcount
        };
        if remaining != 0 {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.evict_if_unused(&self.entry);
        }
    }
}

impl MappedFile {
    /// Give this reference back. Same as dropping it.
    pub fn close(self) {
        drop(self);
    }

    /// Canonical path the file was opened under.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    /// Size of the file in bytes, as seen when it was opened.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entry.stamp.len
    }

    /// Whether the file was empty when opened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry.stamp.len == 0
    }

    /// Modification time (seconds since the epoch) seen when opened.
    #[must_use]
    pub fn mtime(&self) -> i64 {
        self.entry.stamp.mtime
    }

    /// Full identity snapshot taken when opened.
    #[must_use]
    pub fn stamp(&self) -> FileStamp {
        self.entry.stamp
    }

    /// Whether this is a shared-memory object rather than a regular file.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.entry.shared
    }

    /// Number of outstanding external references (opens and clones).
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.entry.state.lock().refcount
    }

    /// Whether a later open found the file changed on disk and replaced this
    /// handle in the cache. The handle stays fully usable.
    #[must_use]
    pub fn is_pending_removal(&self) -> bool {
        self.entry.state.lock().pending_removal
    }

    /// Whether `other` refers to the same underlying handle.
    #[must_use]
    pub fn same_handle(&self, other: &MappedFile) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// Map the whole file, sharing one mapping among all callers.
    ///
    /// # Errors
    ///
    /// Returns `FileCacheError::MapFailed` if the OS refuses the mapping
    /// (including for empty files).
    pub fn map_all(&self, rule: AccessRule) -> Result<Region<'_>> {
        let (addr, len) = self.entry.acquire_whole(rule)?;
        Ok(Region::new(self, addr, 0, len))
    }

    /// Map `[offset, offset + len)`. Repeated requests for the same range share
    /// one mapping; the exact range `[0, self.len())` is the whole-file mapping.
    ///
    /// # Errors
    ///
    /// Returns `FileCacheError::OutOfRange` if the range exceeds the file,
    /// `FileCacheError::InvalidArgument` for an empty range and
    /// `FileCacheError::MapFailed` if the OS refuses the mapping.
    pub fn map_new(&self, rule: AccessRule, offset: u64, len: u64) -> Result<Region<'_>> {
        let (addr, mapped) = self.entry.acquire_range(rule, offset, len)?;
        Ok(Region::new(self, addr, offset, mapped))
    }

    /// Release a mapping. Same as dropping the region.
    pub fn map_free(&self, region: Region<'_>) {
        drop(region);
    }

    /// Whether an I/O fault was reported inside the live mapping at `addr`.
    /// Addresses with no live mapping report `false`.
    #[must_use]
    pub fn map_faulted(&self, addr: MapAddr) -> bool {
        self.entry.is_faulted(addr)
    }

    /// Current holders of the mapping at `addr` (0 when nothing is mapped there).
    #[must_use]
    pub fn map_refcount(&self, addr: MapAddr) -> usize {
        self.entry.refcount_of(addr)
    }

    /// Number of live partial mappings (the whole-file mapping is not counted).
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.entry.state.lock().regions.len()
    }

    /// Snapshot of every live mapping: the whole-file mapping first, then
    /// partial mappings in (offset, len) order.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionInfo> {
        let state = self.entry.state.lock();
        state
            .whole
            .iter()
            .map(|whole| RegionInfo::from_record(whole, true))
            .chain(state.regions.iter().map(|record| RegionInfo::from_record(record, false)))
            .collect()
    }

    pub(crate) fn acquire_whole(&self, rule: AccessRule) -> Result<(MapAddr, usize)> {
        self.entry.acquire_whole(rule)
    }

    /// Tolerates addresses that are not (or no longer) mapped.
    pub(crate) fn release(&self, addr: MapAddr) {
        self.entry.release(addr);
    }
}

/// A live, read-only mapping of part (or all) of a [`MappedFile`].
///
/// Derefs to the mapped bytes. The mapping stays valid for as long as the
/// region lives; dropping it releases this holder's reference.
pub struct Region<'f> {
    file: &'f MappedFile,
    addr: MapAddr,
    offset: u64,
    len: usize,
}

impl std::fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.file.path())
            .field("addr", &format_args!("{:#x}", self.addr.as_usize()))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl<'f> Region<'f> {
    fn new(file: &'f MappedFile, addr: MapAddr, offset: u64, len: usize) -> Self {
        Self {
            file,
            addr,
            offset,
            len,
        }
    }

    /// Address of the first mapped byte.
    #[must_use]
    pub fn addr(&self) -> MapAddr {
        self.addr
    }

    /// File offset of the first mapped byte.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// File this region belongs to.
    #[must_use]
    pub fn file(&self) -> &'f MappedFile {
        self.file
    }

    /// Whether an I/O fault was reported inside this region.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.file.map_faulted(self.addr)
    }

    /// Check the fault flag before trusting the bytes.
    ///
    /// # Errors
    ///
    /// Returns `FileCacheError::AlreadyFaulted` once a fault was reported.
    pub fn verify(&self) -> Result<()> {
        if self.is_faulted() {
            return Err(FileCacheError::AlreadyFaulted {
                offset: self.offset,
                len: self.len as u64,
            });
        }
        Ok(())
    }
}

impl Deref for Region<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: this region holds a reference on the mapping, so the
        // `len` bytes at `addr` stay mapped read-only until it is dropped.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for Region<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        self.file.release(self.addr);
    }
}
