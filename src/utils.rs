//! Utility helpers for page size, alignment, bounds checks and path sanitising.

use std::path::{Component, Path, PathBuf};

use crate::errors::{FileCacheError, Result};

// Used when the platform gives no answer.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Get the system page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unix_page_size()
        } else {
            FALLBACK_PAGE_SIZE
        }
    }
}

#[cfg(unix)]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unix_page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        FALLBACK_PAGE_SIZE
    } else {
        size as usize
    }
}

/// Align a value up to the nearest multiple of `alignment`.
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    if alignment.is_power_of_two() {
        let mask = alignment - 1;
        (value + mask) & !mask
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Align a value down to the nearest multiple of `alignment`.
#[must_use]
pub fn align_down(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    if alignment.is_power_of_two() {
        value & !(alignment - 1)
    } else {
        value - value % alignment
    }
}

/// Ensure the requested [offset, offset+len) range is within [0, total].
///
/// # Errors
///
/// Returns `FileCacheError::OutOfRange` if the range exceeds the file.
pub fn ensure_in_bounds(offset: u64, len: u64, total: u64) -> Result<()> {
    if offset > total {
        return Err(FileCacheError::OutOfRange { offset, len, total });
    }
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(FileCacheError::OutOfRange { offset, len, total }),
    }
}

/// Whether the half-open ranges `[a, a + a_len)` and `[b, b + b_len)` intersect.
#[must_use]
pub fn ranges_overlap(a: usize, a_len: usize, b: usize, b_len: usize) -> bool {
    a_len != 0 && b_len != 0 && a < b.saturating_add(b_len) && b < a.saturating_add(a_len)
}

/// Turn `path` into an absolute path with `.`, `..` and repeated separators
/// collapsed. Purely lexical: symlinks are left alone and the file does not
/// have to exist.
///
/// # Errors
///
/// Returns `FileCacheError::InvalidArgument` for an empty path and
/// `FileCacheError::InvalidPath` if the working directory cannot be read.
pub fn sanitize_path<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(FileCacheError::InvalidArgument("path must not be empty"));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = std::env::current_dir().map_err(|source| FileCacheError::InvalidPath {
            path: path.to_path_buf(),
            source,
        })?;
        cwd.join(path)
    };

    let mut sanitized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => sanitized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                sanitized.pop();
            }
            Component::Normal(name) => sanitized.push(name),
        }
    }
    Ok(sanitized)
}
