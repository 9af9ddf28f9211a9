//! Access-pattern hints applied to freshly mapped or re-used ranges.

use crate::config::{CacheConfig, HUGE_PAGE_SIZE};

/// How the caller intends to walk a mapping.
///
/// The rule only tunes paging behaviour; a rule the OS ignores never changes
/// what the mapping contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessRule {
    /// Pages will be touched in no particular order.
    #[default]
    Random,
    /// Pages will be read front to back.
    Sequential,
    /// The whole range will be needed soon; start reading ahead.
    WillNeed,
    /// Fault every page in right away.
    Populate,
}

/// Apply `rule` to `[addr, addr + len)`. Best effort: failures are logged and
/// otherwise ignored.
pub(crate) fn apply_rule(addr: usize, len: usize, rule: AccessRule, huge: bool, config: &CacheConfig) {
    if len == 0 {
        return;
    }

    if config.advise {
        madvise_range(addr, len, rule);
    }

    if rule == AccessRule::Populate && !populated_by_kernel() {
        touch_pages(addr, len, touch_stride(huge, config));
    }
}

fn touch_stride(huge: bool, config: &CacheConfig) -> usize {
    if huge {
        HUGE_PAGE_SIZE
    } else {
        config.page_size
    }
}

#[cfg(all(unix, feature = "advise"))]
fn madvise_range(addr: usize, len: usize, rule: AccessRule) {
    use crate::utils::{align_down, page_size};
    use libc::{madvise, MADV_RANDOM, MADV_SEQUENTIAL, MADV_WILLNEED};

    let flag = match rule {
        AccessRule::Random => MADV_RANDOM,
        AccessRule::Sequential => MADV_SEQUENTIAL,
        AccessRule::WillNeed | AccessRule::Populate => MADV_WILLNEED,
    };

    // madvise wants a page-aligned start; mappings at unaligned file offsets are not.
    let start = align_down(addr, page_size());
    let length = len + (addr - start);

    // SAFETY: [start, start + length) lies within pages owned by a live mapping.
    let result = unsafe { madvise(start as *mut libc::c_void, length, flag) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        log::warn!("madvise({rule:?}) on {length} bytes at {start:#x} failed: {err}");
    }
}

#[cfg(not(all(unix, feature = "advise")))]
fn madvise_range(_addr: usize, _len: usize, _rule: AccessRule) {}

// Linux maps with MAP_POPULATE instead of touching pages by hand.
fn populated_by_kernel() -> bool {
    cfg!(target_os = "linux")
}

/// Read one byte per `stride` so every page of the range is faulted in.
fn touch_pages(addr: usize, len: usize, stride: usize) -> u8 {
    let stride = stride.max(1);
    let mut acc = 0u8;
    let mut offset = 0;
    while offset < len {
        // SAFETY: offset < len, and the caller guarantees the range is mapped and readable.
        acc ^= unsafe { std::ptr::read_volatile((addr + offset) as *const u8) };
        offset += stride;
    }
    // SAFETY: len > 0 here, so the last byte is inside the mapping.
    acc ^= unsafe { std::ptr::read_volatile((addr + len - 1) as *const u8) };
    acc
}
