//! Tunables for a [`FileCache`](crate::cache::FileCache).

use crate::utils::page_size;

/// Mappings larger than this are first attempted with huge pages.
pub const DEFAULT_HUGE_PAGE_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Huge page size assumed when pages have to be touched by hand.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Configuration shared by every file opened through one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Try huge-page backed mappings for large ranges (Linux, feature `hugepages`).
    pub huge_pages: bool,
    /// Size in bytes above which huge pages are attempted.
    pub huge_page_threshold: u64,
    /// Pass access-pattern hints to the OS (feature `advise`).
    pub advise: bool,
    /// Stride used when pages have to be touched by hand to populate a mapping.
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            huge_pages: cfg!(feature = "hugepages"),
            huge_page_threshold: DEFAULT_HUGE_PAGE_THRESHOLD,
            advise: cfg!(feature = "advise"),
            page_size: page_size(),
        }
    }
}

impl CacheConfig {
    /// Whether a mapping of `len` bytes should first try huge pages.
    #[must_use]
    pub fn wants_huge_pages(&self, len: u64) -> bool {
        self.huge_pages && len > self.huge_page_threshold
    }
}

/// Builder for [`FileCache`](crate::cache::FileCache).
///
/// # Examples
///
/// ```
/// use mmap_filecache::FileCache;
///
/// let cache = FileCache::builder()
///     .huge_pages(false)
///     .advise(true)
///     .build();
/// assert!(cache.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileCacheBuilder {
    config: CacheConfig,
}

impl FileCacheBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable huge-page attempts.
    #[must_use]
    pub fn huge_pages(mut self, enabled: bool) -> Self {
        self.config.huge_pages = enabled;
        self
    }

    /// Set the size above which huge pages are attempted.
    #[must_use]
    pub fn huge_page_threshold(mut self, bytes: u64) -> Self {
        self.config.huge_page_threshold = bytes;
        self
    }

    /// Enable or disable access-pattern hints.
    #[must_use]
    pub fn advise(mut self, enabled: bool) -> Self {
        self.config.advise = enabled;
        self
    }

    /// Override the stride used for manual page population. Zero is ignored.
    #[must_use]
    pub fn page_size(mut self, bytes: usize) -> Self {
        if bytes != 0 {
            self.config.page_size = bytes;
        }
        self
    }

    /// Finish and return the configuration without building a cache.
    #[must_use]
    pub fn config(self) -> CacheConfig {
        self.config
    }

    /// Build the cache.
    #[must_use]
    pub fn build(self) -> crate::cache::FileCache {
        crate::cache::FileCache::with_config(self.config)
    }
}
