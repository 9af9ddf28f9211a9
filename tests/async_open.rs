#![cfg(feature = "async")]
//! Async helpers: open and read off the executor threads.

use mmap_filecache::manager::r#async::{open_async, read_region_async};
use mmap_filecache::{FileCache, FileCacheError, OpenMode};
use std::fs;
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread")]
async fn async_open_shares_the_cache() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("async.bin");
    fs::write(&path, b"ASYNC-OPEN").expect("write");

    let cache = FileCache::new();
    let a = open_async(&cache, &path, OpenMode::Regular).await.expect("open a");
    let b = cache.open(&path, OpenMode::Regular).expect("open b");
    assert!(a.same_handle(&b));
    assert_eq!(a.refcount(), 2);

    let bytes = read_region_async(&a, 6, 4).await.expect("read");
    assert_eq!(bytes, b"OPEN");
    assert_eq!(a.region_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_open_reports_errors() {
    let dir = tempdir().expect("tempdir");
    let cache = FileCache::new();
    let err = open_async(&cache, dir.path().join("nope"), OpenMode::Regular)
        .await
        .unwrap_err();
    assert!(matches!(err, FileCacheError::OpenFailed { .. }));
}
