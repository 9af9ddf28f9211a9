//! POSIX shared-memory objects opened through the cache (Linux).

#![cfg(target_os = "linux")]

use mmap_filecache::{open_shared, AccessRule, FileCache, FileCacheError, OpenMode};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;

struct ShmObject {
    name: String,
}

impl ShmObject {
    fn create(tag: &str, contents: &[u8]) -> Self {
        let name = format!("/mmap_filecache_{}_{}", tag, std::process::id());
        let c_name = CString::new(name.clone()).expect("cstring");
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC, 0o600) };
        assert!(fd >= 0, "shm_open: {}", io::Error::last_os_error());
        let mut file = unsafe { File::from_raw_fd(fd) };
        file.write_all(contents).expect("fill shm");
        Self { name }
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        let c_name = CString::new(self.name.clone()).expect("cstring");
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
        }
    }
}

#[test]
fn open_and_map_shared_object() {
    let shm = ShmObject::create("map", b"hello from shm\nsecond");
    let cache = FileCache::new();

    let file = cache.open(&shm.name, OpenMode::Shared).expect("open shm");
    assert!(file.is_shared());
    assert_eq!(file.len(), 21);

    let whole = file.map_all(AccessRule::Random).expect("map");
    assert_eq!(&*whole, b"hello from shm\nsecond");
    drop(whole);

    let again = open_shared(&cache, &shm.name).expect("open again");
    assert!(again.same_handle(&file));

    let mut lines = again.lines().expect("lines");
    let first = lines.next().expect("first");
    assert_eq!(lines.content(&first), b"hello from shm");
}

#[test]
fn missing_shared_object_fails_to_open() {
    let cache = FileCache::new();
    let name = format!("/mmap_filecache_missing_{}", std::process::id());
    match cache.open(&name, OpenMode::Shared) {
        Err(FileCacheError::OpenFailed { source, .. }) => {
            assert_eq!(source.kind(), io::ErrorKind::NotFound);
        }
        other => panic!("expected OpenFailed, got {other:?}"),
    }
    assert!(cache.is_empty());
}
