//! Low-level read-only mapping primitive shared by partial and whole-file maps.

use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapOptions};

use crate::advise::{apply_rule, AccessRule};
use crate::config::CacheConfig;

/// Base address of a live mapping, as handed out to callers.
///
/// Used to release a mapping or to query its fault flag. The value is only
/// meaningful while the mapping it came from is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapAddr(usize);

impl MapAddr {
    pub(crate) fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address value.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Raw address as a pointer.
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

/// Memory behind a [`MapRecord`]: a plain memmap2 mapping, or a hugetlb
/// mapping made directly through libc.
enum Backing {
    Plain(Mmap),
    #[cfg(all(target_os = "linux", feature = "hugepages"))]
    Huge(HugeMap),
}

impl Backing {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Self::Plain(map) => map.as_ptr(),
            #[cfg(all(target_os = "linux", feature = "hugepages"))]
            Self::Huge(map) => map.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Plain(map) => map.len(),
            #[cfg(all(target_os = "linux", feature = "hugepages"))]
            Self::Huge(map) => map.len,
        }
    }
}

/// Read-only `MAP_HUGETLB` file mapping, unmapped on drop.
///
/// memmap2 only honours its huge-page option for anonymous maps, so file
/// mappings that want huge pages go through `mmap(2)` directly.
#[cfg(all(target_os = "linux", feature = "hugepages"))]
struct HugeMap {
    base: *mut libc::c_void,
    map_len: usize,
    delta: usize,
    len: usize,
}

// SAFETY: the mapping is read-only and owned exclusively by this value.
#[cfg(all(target_os = "linux", feature = "hugepages"))]
unsafe impl Send for HugeMap {}
// SAFETY: as above; shared access only ever reads.
#[cfg(all(target_os = "linux", feature = "hugepages"))]
unsafe impl Sync for HugeMap {}

#[cfg(all(target_os = "linux", feature = "hugepages"))]
impl HugeMap {
    fn map(file: &File, offset: u64, len: usize, rule: AccessRule) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let page = crate::utils::page_size() as u64;
        let delta = usize::try_from(offset % page)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset delta exceeds address space"))?;
        let aligned = libc::off_t::try_from(offset - offset % page)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds off_t"))?;
        let map_len = len + delta;

        let mut flags = libc::MAP_SHARED | libc::MAP_HUGETLB;
        if rule == AccessRule::Populate {
            flags |= libc::MAP_POPULATE;
        }
        // SAFETY: a fresh read-only mapping at a kernel-chosen address; the
        // descriptor stays open for the duration of the call.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                flags,
                file.as_raw_fd(),
                aligned,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base,
            map_len,
            delta,
            len,
        })
    }

    fn as_ptr(&self) -> *const u8 {
        (self.base as *const u8).wrapping_add(self.delta)
    }
}

#[cfg(all(target_os = "linux", feature = "hugepages"))]
impl Drop for HugeMap {
    fn drop(&mut self) {
        // SAFETY: `base`/`map_len` describe the mapping created in `map`,
        // and nothing borrows it past this point.
        if unsafe { libc::munmap(self.base, self.map_len) } != 0 {
            log::warn!("munmap of huge page mapping failed: {}", io::Error::last_os_error());
        }
    }
}

/// One OS mapping plus the bookkeeping every holder shares.
pub(crate) struct MapRecord {
    map: Backing,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) refcount: usize,
    pub(crate) faulty: bool,
    pub(crate) huge: bool,
    pub(crate) rule: AccessRule,
}

impl std::fmt::Debug for MapRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRecord")
            .field("addr", &format_args!("{:#x}", self.addr().as_usize()))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("refcount", &self.refcount)
            .field("faulty", &self.faulty)
            .field("huge", &self.huge)
            .finish()
    }
}

impl MapRecord {
    /// Map `[offset, offset + len)` of `file` read-only and shared.
    ///
    /// Large ranges try huge pages first and silently retry with normal pages.
    /// The returned record has a reference count of zero; the rule has not been
    /// applied yet.
    pub(crate) fn map(
        file: &File,
        offset: u64,
        len: u64,
        rule: AccessRule,
        config: &CacheConfig,
    ) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map zero bytes"));
        }
        let length = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping length exceeds address space"))?;

        if config.wants_huge_pages(len) {
            match map_huge(file, offset, length, rule) {
                Ok(map) => return Ok(Self::from_backing(map, offset, len, rule, true)),
                Err(err) => {
                    log::debug!("huge page mapping of {len} bytes at offset {offset} refused ({err}), retrying with normal pages");
                }
            }
        }

        let map = map_plain(file, offset, length, rule)?;
        Ok(Self::from_backing(Backing::Plain(map), offset, len, rule, false))
    }

    fn from_backing(map: Backing, offset: u64, len: u64, rule: AccessRule, huge: bool) -> Self {
        Self {
            map,
            offset,
            len,
            refcount: 0,
            faulty: false,
            huge,
            rule,
        }
    }

    /// Address of the first requested byte.
    pub(crate) fn addr(&self) -> MapAddr {
        MapAddr::new(self.map.as_ptr() as usize)
    }

    /// Length of the mapped range in bytes.
    pub(crate) fn byte_len(&self) -> usize {
        self.map.len()
    }

    /// Take one more reference and re-apply the access hint.
    pub(crate) fn acquire(&mut self, rule: AccessRule, config: &CacheConfig) {
        self.refcount += 1;
        self.rule = rule;
        apply_rule(self.addr().as_usize(), self.byte_len(), rule, self.huge, config);
    }

    /// Drop one reference. Returns `true` once nobody holds the record anymore.
    pub(crate) fn release(&mut self) -> bool {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }

    /// Whether `[addr, addr + page)` touches this mapping.
    pub(crate) fn contains_fault(&self, addr: usize, page: usize) -> bool {
        crate::utils::ranges_overlap(addr, page, self.addr().as_usize(), self.byte_len())
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "hugepages"))] {
        fn map_huge(file: &File, offset: u64, len: usize, rule: AccessRule) -> io::Result<Backing> {
            HugeMap::map(file, offset, len, rule).map(Backing::Huge)
        }
    } else {
        fn map_huge(_file: &File, _offset: u64, _len: usize, _rule: AccessRule) -> io::Result<Backing> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "huge pages unavailable"))
        }
    }
}

fn map_plain(file: &File, offset: u64, len: usize, rule: AccessRule) -> io::Result<Mmap> {
    let mut opts = MmapOptions::new();
    opts.offset(offset).len(len);

    #[cfg(target_os = "linux")]
    {
        if rule == AccessRule::Populate {
            opts.populate();
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = rule;

    // SAFETY: the mapping is read-only; callers accept that truncating the file
    // underneath a live mapping faults on access, which is what the fault
    // tracker records.
    unsafe { opts.map(file) }
}
