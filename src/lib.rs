//! # mmap-filecache: shared, reference-counted read-only file mappings
//!
//! A [`FileCache`] hands out [`MappedFile`] handles keyed by canonical path.
//! Opening the same unchanged file twice yields the same handle; mappings of
//! the same byte range are shared and reference-counted; a file that changed
//! on disk gets a fresh handle while existing users keep the old one.
//!
//! ## Features
//!
//! - **Shared mappings**: one OS mapping per distinct `(offset, len)` range,
//!   plus one whole-file mapping per file
//! - **Fault tracking**: I/O faults reported by address stick to the mapping
//!   they hit
//! - **Line iteration**: zero-copy splitting on `\n` / `\r` with line numbers
//! - **Huge pages**: large mappings try huge pages first (Linux)
//! - **Async support**: optional Tokio helpers
//!
//! ## Quick Start
//!
//! ```no_run
//! use mmap_filecache::{AccessRule, FileCache, OpenMode};
//!
//! let cache = FileCache::new();
//! let file = cache.open("data.txt", OpenMode::Regular)?;
//!
//! // Map a range and read it in place
//! let region = file.map_new(AccessRule::Random, 0, 16)?;
//! println!("{:?}", &region[..]);
//!
//! // Walk the lines
//! file.lines()?.for_each_line(|line, bytes| {
//!     println!("{}: {}", line.index(), String::from_utf8_lossy(bytes));
//!     Ok::<(), std::convert::Infallible>(())
//! }).ok();
//! # Ok::<(), mmap_filecache::FileCacheError>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: Error types for all cache operations
//! - [`utils`]: Page size, alignment, bounds checks and path canonicalisation
//! - [`config`]: Cache configuration and builder
//! - [`cache`]: The file registry and fault reporting
//! - [`handle`]: File handles and mapped regions
//! - [`lines`]: Line iterator
//! - [`manager`]: High-level convenience functions
//!
//! ## Feature Flags
//!
//! - `advise`: Pass access hints to the OS (`madvise`). Default.
//! - `hugepages`: Try huge-page backed mappings for large ranges. Default.
//! - `async`: Enables Tokio-based helpers in `manager::r#async`

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]
#![doc(html_root_url = "https://docs.rs/mmap-filecache")]

pub mod advise;
pub mod cache;
pub mod config;
pub mod errors;
pub mod handle;
pub mod lines;
pub mod manager;
pub mod mmap;
mod region;
pub mod utils;

pub use advise::AccessRule;
pub use cache::{FileCache, OpenMode};
pub use config::{CacheConfig, FileCacheBuilder, DEFAULT_HUGE_PAGE_THRESHOLD, HUGE_PAGE_SIZE};
pub use errors::{FileCacheError, Result};
pub use handle::{FileStamp, MappedFile, Region, RegionInfo};
pub use lines::{Line, Lines};
pub use manager::{map_file_lines, open_file, open_shared, read_region};
pub use mmap::MapAddr;
