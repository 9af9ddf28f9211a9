//! Basic integration tests for mmap-filecache.

use mmap_filecache::{AccessRule, FileCache, FileCacheError, OpenMode};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, bytes).expect("write");
    path
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn open_twice_shares_handle_and_mapping() {
    let dir = tempdir().expect("tempdir");
    let data = pattern(1024);
    let path = write_file(&dir, "shared.bin", &data);
    let cache = FileCache::new();

    let h1 = cache.open(&path, OpenMode::Regular).expect("open 1");
    let h2 = cache.open(&path, OpenMode::Regular).expect("open 2");
    assert!(h1.same_handle(&h2));
    assert_eq!(h1.refcount(), 2);
    assert_eq!(h1.len(), 1024);
    assert!(!h1.is_shared());

    let m1 = h1.map_new(AccessRule::Random, 0, 100).expect("map 1");
    let m2 = h2.map_new(AccessRule::Sequential, 0, 100).expect("map 2");
    assert_eq!(m1.addr(), m2.addr());
    assert_eq!(h1.map_refcount(m1.addr()), 2);
    assert_eq!(h1.region_count(), 1);
    assert_eq!(&*m1, &data[..100]);

    h2.map_free(m2);
    assert_eq!(h1.map_refcount(m1.addr()), 1);
    drop(m1);
    assert_eq!(h1.region_count(), 0);

    h2.close();
    assert_eq!(h1.refcount(), 1);
    assert!(cache.contains(&path));
    h1.close();
    assert!(!cache.contains(&path));
    assert!(cache.is_empty());
}

#[test]
fn full_range_is_whole_file_mapping() {
    let dir = tempdir().expect("tempdir");
    let data = pattern(10_000);
    let path = write_file(&dir, "whole.bin", &data);
    let cache = FileCache::new();
    let file = cache.open(&path, OpenMode::Regular).expect("open");

    let whole = file.map_all(AccessRule::WillNeed).expect("map_all");
    let range = file.map_new(AccessRule::Random, 0, file.len()).expect("map_new");
    assert_eq!(whole.addr(), range.addr());
    assert_eq!(file.region_count(), 0);
    assert_eq!(file.map_refcount(whole.addr()), 2);
    assert_eq!(&*range, &data[..]);

    let infos = file.regions();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].whole_file);
}

#[test]
fn unaligned_regions_see_the_right_bytes() {
    let dir = tempdir().expect("tempdir");
    let data = pattern(3 * 4096 + 17);
    let path = write_file(&dir, "unaligned.bin", &data);
    let cache = FileCache::new();
    let file = cache.open(&path, OpenMode::Regular).expect("open");

    for (offset, len) in [(1u64, 10u64), (4095, 2), (4097, 4096), (3 * 4096, 17)] {
        let region = file.map_new(AccessRule::Random, offset, len).expect("map");
        assert_eq!(region.offset(), offset);
        assert_eq!(region.len() as u64, len);
        assert_eq!(&*region, &data[offset as usize..(offset + len) as usize]);
    }
    assert_eq!(file.region_count(), 0);
}

#[test]
fn repeated_map_and_free_leaves_nothing_behind() {
    let dir = tempdir().expect("tempdir");
    let path = write_file(&dir, "churn.bin", &pattern(64 * 1024));
    let cache = FileCache::new();
    let file = cache.open(&path, OpenMode::Regular).expect("open");

    for round in 0..200u64 {
        let offset = (round * 313) % 60_000;
        let a = file.map_new(AccessRule::Random, offset, 100).expect("a");
        let b = file.map_new(AccessRule::Random, offset, 100).expect("b");
        assert_eq!(a.addr(), b.addr());
        let whole = file.map_all(AccessRule::Sequential).expect("whole");
        assert_eq!(whole[offset as usize], a[0]);
    }
    assert_eq!(file.region_count(), 0);
    assert!(file.regions().is_empty());
}

#[test]
fn out_of_range_and_empty_requests() {
    let dir = tempdir().expect("tempdir");
    let path = write_file(&dir, "bounds.bin", &[0u8; 100]);
    let cache = FileCache::new();
    let file = cache.open(&path, OpenMode::Regular).expect("open");

    assert!(matches!(
        file.map_new(AccessRule::Random, 100, 1),
        Err(FileCacheError::OutOfRange { .. })
    ));
    assert!(matches!(
        file.map_new(AccessRule::Random, u64::MAX, 2),
        Err(FileCacheError::OutOfRange { .. })
    ));
    assert!(matches!(
        file.map_new(AccessRule::Random, 0, 0),
        Err(FileCacheError::InvalidArgument(_))
    ));
    assert_eq!(file.region_count(), 0);
}

#[test]
fn empty_file_cannot_be_mapped() {
    let dir = tempdir().expect("tempdir");
    let path = write_file(&dir, "empty.bin", b"");
    let cache = FileCache::new();
    let file = cache.open(&path, OpenMode::Regular).expect("open");

    assert!(file.is_empty());
    assert!(matches!(
        file.map_all(AccessRule::Random),
        Err(FileCacheError::MapFailed { .. })
    ));
    assert!(file.regions().is_empty());
}

#[test]
fn clones_count_as_opens() {
    let dir = tempdir().expect("tempdir");
    let path = write_file(&dir, "clone.bin", b"clone");
    let cache = FileCache::new();

    let file = cache.open(&path, OpenMode::Regular).expect("open");
    let copy = file.clone();
    assert_eq!(file.refcount(), 2);
    drop(file);
    assert!(cache.contains(&path));
    assert_eq!(copy.refcount(), 1);
    drop(copy);
    assert!(cache.is_empty());
}

#[test]
fn lines_through_the_cache() {
    let dir = tempdir().expect("tempdir");
    let path = write_file(&dir, "lines.txt", b"a\nbb\r\nccc");
    let cache = FileCache::new();
    let file = cache.open(&path, OpenMode::Regular).expect("open");

    let mut out = Vec::new();
    file.lines()
        .expect("lines")
        .for_each_line(|line, bytes| {
            out.push((bytes.to_vec(), line.index()));
            Ok::<(), ()>(())
        })
        .expect("walk");
    assert_eq!(
        out,
        vec![(b"a".to_vec(), 0), (b"bb".to_vec(), 1), (b"ccc".to_vec(), 2)]
    );
    assert_eq!(file.refcount(), 1);
    assert!(file.regions().is_empty());
}

#[test]
fn builder_config_reaches_the_cache() {
    let cache = FileCache::builder()
        .huge_pages(false)
        .advise(false)
        .huge_page_threshold(1 << 30)
        .build();
    assert!(!cache.config().huge_pages);
    assert!(!cache.config().advise);
    assert_eq!(cache.config().huge_page_threshold, 1 << 30);
}

#[test]
fn whole_mapping_survives_closing_the_other_handle() {
    let dir = tempdir().expect("tempdir");
    let data = pattern(1024);
    let path = write_file(&dir, "scenario.bin", &data);
    let cache = FileCache::new();

    let first = cache.open(&path, OpenMode::Regular).expect("open 1");
    let second = cache.open(&path, OpenMode::Regular).expect("open 2");
    assert_eq!(first.refcount(), 2);

    let whole = first.map_all(AccessRule::Random).expect("map_all");
    assert_eq!(first.map_refcount(whole.addr()), 1);

    second.close();
    assert_eq!(first.refcount(), 1);
    assert!(cache.contains(&path));
    assert_eq!(&*whole, &data[..]);

    first.map_free(whole);
    assert!(first.regions().is_empty());
    assert!(cache.contains(&path));

    first.close();
    assert!(cache.is_empty());
}
