//! Zero-copy line iteration over a whole-file mapping.
//!
//! Lines are split on `\n` and `\r`. A run of terminators between two lines
//! counts as many line breaks as it holds bytes equal to the run's first byte,
//! so `\n\n` is one empty line while `\r\n` is a single break.

use std::iter::FusedIterator;
use std::ops::Range;

use crate::advise::AccessRule;
use crate::errors::{FileCacheError, Result};
use crate::handle::MappedFile;
use crate::mmap::MapAddr;
use crate::utils::align_up;

/// Terminator searches never cross this address boundary in one step, so a
/// long line only pulls in the pages it actually spans.
const SEARCH_BOUNDARY: usize = 4096;

/// One line of a file, as byte offsets into it.
///
/// Read the bytes through [`Lines::content`] or [`Lines::for_each_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Line {
    start: usize,
    end: usize,
    index: usize,
    len: usize,
}

impl Line {
    /// Offset of the first byte of the line.
    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Offset just past the terminator (or the end of file for the last line).
    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Zero-based line number.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Length of the line content, terminator excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the line has no content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte range of the content within the file.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

fn is_terminator(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

/// Splitting state, independent of where the bytes live.
#[derive(Debug, Clone, Default)]
struct Splitter {
    // Sits on the previous line's terminator once a line has been produced.
    pos: usize,
    index: usize,
    done: bool,
}

impl Splitter {
    /// Next line of `data`, which starts at address `base`.
    fn next_line(&mut self, data: &[u8], base: usize) -> Option<Line> {
        if self.done {
            return None;
        }
        let total = data.len();
        let mut p = self.pos;

        if let Some(&first) = data.get(p).filter(|b| is_terminator(**b)) {
            while let Some(&byte) = data.get(p).filter(|b| is_terminator(**b)) {
                if byte == first {
                    self.index += 1;
                }
                p += 1;
            }
        }
        if p >= total {
            self.pos = total;
            self.done = true;
            return None;
        }

        let start = p;
        let (end, len) = match find_terminator(data, start, base) {
            Some(at) => {
                self.pos = at;
                (at + 1, at - start)
            }
            None => {
                self.pos = total;
                self.done = true;
                (total, total - start)
            }
        };
        Some(Line {
            start,
            end,
            index: self.index,
            len,
        })
    }
}

/// Position of the first terminator at or after `from`, scanning one
/// boundary-aligned chunk at a time.
fn find_terminator(data: &[u8], from: usize, base: usize) -> Option<usize> {
    let mut chunk_start = from;
    while chunk_start < data.len() {
        let next_boundary = align_up(base + chunk_start + 1, SEARCH_BOUNDARY);
        let chunk_end = (next_boundary - base).min(data.len());
        if let Some(found) = data[chunk_start..chunk_end].iter().position(|b| is_terminator(*b)) {
            return Some(chunk_start + found);
        }
        chunk_start = chunk_end;
    }
    None
}

/// Iterator over the lines of a [`MappedFile`].
///
/// Holds a reference on the file and on its whole-file mapping until dropped.
///
/// # Examples
///
/// ```no_run
/// use mmap_filecache::{FileCache, OpenMode};
///
/// let cache = FileCache::new();
/// let file = cache.open("notes.txt", OpenMode::Regular)?;
/// let mut lines = file.lines()?;
/// while let Some(line) = lines.next() {
///     println!("{}: {}", line.index(), String::from_utf8_lossy(lines.content(&line)));
/// }
/// # Ok::<(), mmap_filecache::FileCacheError>(())
/// ```
pub struct Lines {
    file: MappedFile,
    addr: MapAddr,
    len: usize,
    splitter: Splitter,
    current: Option<Line>,
}

impl std::fmt::Debug for Lines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lines")
            .field("path", &self.file.path())
            .field("len", &self.len)
            .field("current", &self.current)
            .finish()
    }
}

impl MappedFile {
    /// Iterate over the lines of the file through its whole-file mapping.
    ///
    /// # Errors
    ///
    /// Returns `FileCacheError::InvalidArgument` for an empty file and
    /// `FileCacheError::MapFailed` if the file cannot be mapped.
    pub fn lines(&self) -> Result<Lines> {
        if self.is_empty() {
            return Err(FileCacheError::InvalidArgument("cannot iterate lines of an empty file"));
        }
        let (addr, len) = self.acquire_whole(AccessRule::Sequential)?;
        Ok(Lines {
            file: self.clone(),
            addr,
            len,
            splitter: Splitter::default(),
            current: None,
        })
    }
}

impl Lines {
    fn data(&self) -> &[u8] {
        // SAFETY: `self` holds a reference on the whole-file mapping at `addr`
        // until it is dropped.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    /// Bytes of `line`, terminator excluded. Lines from another file may
    /// come back empty.
    #[must_use]
    pub fn content(&self, line: &Line) -> &[u8] {
        self.data().get(line.range()).unwrap_or_default()
    }

    /// Most recently produced line.
    #[must_use]
    pub fn current(&self) -> Option<&Line> {
        self.current.as_ref()
    }

    /// File being iterated.
    #[must_use]
    pub fn file(&self) -> &MappedFile {
        &self.file
    }

    /// Feed every remaining line to `f`, stopping at its first error.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns first.
    pub fn for_each_line<F, E>(mut self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&Line, &[u8]) -> std::result::Result<(), E>,
    {
        while let Some(line) = self.next() {
            f(&line, self.content(&line))?;
        }
        Ok(())
    }
}

impl Iterator for Lines {
    type Item = Line;

    fn next(&mut self) -> Option<Line> {
        let base = self.addr.as_usize();
        let mut splitter = std::mem::take(&mut self.splitter);
        let line = splitter.next_line(self.data(), base);
        self.splitter = splitter;
        if line.is_some() {
            self.current = line;
        }
        line
    }
}

impl FusedIterator for Lines {}

impl Drop for Lines {
    fn drop(&mut self) {
        self.file.release(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileCache, OpenMode};

    fn split(data: &[u8], base: usize) -> Vec<(String, usize)> {
        let mut splitter = Splitter::default();
        let mut out = Vec::new();
        while let Some(line) = splitter.next_line(data, base) {
            out.push((String::from_utf8_lossy(&data[line.range()]).into_owned(), line.index()));
        }
        out
    }

    fn owned(expected: &[(&str, usize)]) -> Vec<(String, usize)> {
        expected.iter().map(|(s, i)| ((*s).to_owned(), *i)).collect()
    }

    #[test]
    fn test_mixed_terminators() {
        assert_eq!(split(b"a\nbb\r\nccc", 0), owned(&[("a", 0), ("bb", 1), ("ccc", 2)]));
    }

    #[test]
    fn test_trailing_terminator_ends_sequence() {
        assert_eq!(split(b"one\ntwo\n", 0), owned(&[("one", 0), ("two", 1)]));
        assert_eq!(split(b"one\r\n\r\n", 0), owned(&[("one", 0)]));
    }

    #[test]
    fn test_leading_and_blank_lines_advance_index() {
        assert_eq!(split(b"\n\nabc", 0), owned(&[("abc", 2)]));
        assert_eq!(split(b"a\n\n\nb", 0), owned(&[("a", 0), ("b", 3)]));
        assert_eq!(split(b"a\n\r\nb", 0), owned(&[("a", 0), ("b", 2)]));
        // Only bytes matching the first one of the run count.
        assert_eq!(split(b"a\r\n\nb", 0), owned(&[("a", 0), ("b", 1)]));
    }

    #[test]
    fn test_only_terminators() {
        assert!(split(b"\r\n\r\n\n", 0).is_empty());
    }

    #[test]
    fn test_line_offsets() {
        let mut splitter = Splitter::default();
        let data = b"ab\ncd";
        let first = splitter.next_line(data, 0).expect("first");
        assert_eq!((first.start(), first.end(), first.len()), (0, 3, 2));
        let second = splitter.next_line(data, 0).expect("second");
        assert_eq!((second.start(), second.end(), second.len()), (3, 5, 2));
        assert!(splitter.next_line(data, 0).is_none());
        assert!(splitter.next_line(data, 0).is_none());
    }

    #[test]
    fn test_long_line_crosses_search_boundaries() {
        let mut data = vec![b'x'; 10_000];
        data.push(b'\n');
        data.extend_from_slice(b"tail");
        // An unaligned base puts boundaries mid-line.
        for base in [0, 4000, 4095] {
            let mut splitter = Splitter::default();
            let long = splitter.next_line(&data, base).expect("long");
            assert_eq!(long.len(), 10_000);
            assert_eq!(long.end(), 10_001);
            let tail = splitter.next_line(&data, base).expect("tail");
            assert_eq!(&data[tail.range()], b"tail");
            assert_eq!(tail.index(), 1);
        }
    }

    #[test]
    fn test_lines_over_mapped_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lines.txt");
        std::fs::write(&path, b"first\r\nsecond\nthird").expect("write");

        let cache = FileCache::new();
        let file = cache.open(&path, OpenMode::Regular).expect("open");
        let mut lines = file.lines().expect("lines");
        assert_eq!(file.refcount(), 2);

        let mut seen = Vec::new();
        while let Some(line) = lines.next() {
            seen.push(String::from_utf8_lossy(lines.content(&line)).into_owned());
            assert_eq!(lines.current(), Some(&line));
        }
        assert_eq!(seen, ["first", "second", "third"]);
        assert!(lines.next().is_none());

        drop(lines);
        assert_eq!(file.refcount(), 1);
        assert!(file.regions().is_empty());
    }

    #[test]
    fn test_for_each_line_stops_on_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stop.txt");
        std::fs::write(&path, b"1\n2\nstop\n4\n").expect("write");

        let cache = FileCache::new();
        let file = cache.open(&path, OpenMode::Regular).expect("open");
        let mut sum = 0;
        let result = file.lines().expect("lines").for_each_line(|_, bytes| {
            if bytes == b"stop" {
                return Err("stopped");
            }
            sum += bytes[0] - b'0';
            Ok(())
        });
        assert_eq!(result, Err("stopped"));
        assert_eq!(sum, 3);
        assert_eq!(file.refcount(), 1);
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"").expect("write");

        let cache = FileCache::new();
        let file = cache.open(&path, OpenMode::Regular).expect("open");
        assert!(matches!(file.lines(), Err(FileCacheError::InvalidArgument(_))));
    }
}
