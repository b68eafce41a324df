//! File metadata and resumption manifest types.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// Receiver-side allocation status of a file, echoed back in block headers
/// so the receiver knows how to place incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FileAllocationStatus {
    /// File does not exist on the receiver
    #[default]
    NotExists = 0,
    /// File exists on the receiver with the correct size
    ExistsCorrectSize = 1,
    /// File exists on the receiver but is too large
    ExistsTooLarge = 2,
    /// File exists on the receiver but is too small
    ExistsTooSmall = 3,
    /// File is no longer needed and should be deleted by the receiver
    ToBeDeleted = 4,
}

impl TryFrom<u8> for FileAllocationStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::NotExists),
            1 => Ok(Self::ExistsCorrectSize),
            2 => Ok(Self::ExistsTooLarge),
            3 => Ok(Self::ExistsTooSmall),
            4 => Ok(Self::ToBeDeleted),
            other => Err(other),
        }
    }
}

/// Metadata for one discovered regular file.
///
/// Shared between all blocks of the file; blocks reference it through an
/// `Arc` so a pre-opened descriptor can be reused across blocks.
#[derive(Debug)]
pub struct SourceMetaData {
    /// Path relative to the transfer root, with `/` separators
    pub rel_path: String,
    /// Absolute path used to open the file
    pub full_path: PathBuf,
    /// File size observed at discovery time
    pub size: u64,
    /// Monotonically assigned sequence id
    pub seq_id: i64,
    /// Sequence id from a previous transfer, used on size mismatch during
    /// resumption (-1 when not resuming)
    pub prev_seq_id: i64,
    /// Receiver-side allocation status
    pub allocation_status: FileAllocationStatus,
    /// Pre-opened descriptor shared by all blocks of this file, if any
    pub file: Option<Arc<File>>,
    /// Whether reads should bypass the page cache
    pub direct_reads: bool,
}

/// Explicit file-list entry supplied by the caller when directory discovery
/// is disabled.
#[derive(Debug, Clone)]
pub struct WdtFileInfo {
    /// File name relative to the transfer root
    pub file_name: String,
    /// Expected size; `None` means read the size from the filesystem
    pub file_size: Option<u64>,
    /// Whether to read this file with direct I/O
    pub direct_reads: bool,
}

impl WdtFileInfo {
    /// Create an entry that takes its size from the filesystem
    #[must_use]
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            file_size: None,
            direct_reads: false,
        }
    }
}

/// A contiguous byte range of a file, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    /// Start offset, inclusive
    pub start: u64,
    /// End offset, exclusive
    pub end: u64,
}

impl Interval {
    /// Create a new interval; `end` must not precede `start`
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(end >= start);
        Self { start, end }
    }

    /// Number of bytes covered by this interval
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Byte ranges of one file already present on the receiver, delivered as
/// part of the resumption manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChunksInfo {
    /// Sequence id the receiver knows the file under
    pub seq_id: i64,
    /// File name relative to the transfer root
    pub file_name: String,
    /// File size on the receiver
    pub file_size: u64,
    /// Ranges already present on the receiver
    pub chunks: Vec<Interval>,
}

impl FileChunksInfo {
    /// Create manifest info with no chunks yet
    #[must_use]
    pub fn new(seq_id: i64, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            seq_id,
            file_name: file_name.into(),
            file_size,
            chunks: Vec::new(),
        }
    }

    /// Record one more present range
    pub fn add_chunk(&mut self, chunk: Interval) {
        self.chunks.push(chunk);
    }

    /// Sort and coalesce overlapping or adjacent ranges
    pub fn merge_chunks(&mut self) {
        if self.chunks.len() < 2 {
            return;
        }
        self.chunks.sort_unstable();
        let mut merged: Vec<Interval> = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks.drain(..) {
            match merged.last_mut() {
                Some(last) if chunk.start <= last.end => {
                    last.end = last.end.max(chunk.end);
                }
                _ => merged.push(chunk),
            }
        }
        self.chunks = merged;
    }

    /// Ranges of `[0, cur_file_size)` NOT covered by the present chunks,
    /// i.e. the bytes that still need to be sent.
    #[must_use]
    pub fn remaining_chunks(&self, cur_file_size: u64) -> Vec<Interval> {
        let mut info = self.clone();
        info.merge_chunks();
        let mut remaining = Vec::new();
        let mut cursor = 0u64;
        for chunk in &info.chunks {
            if chunk.start >= cur_file_size {
                break;
            }
            if chunk.start > cursor {
                remaining.push(Interval::new(cursor, chunk.start));
            }
            cursor = cursor.max(chunk.end);
        }
        if cursor < cur_file_size {
            remaining.push(Interval::new(cursor, cur_file_size));
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_status_roundtrip() {
        for status in [
            FileAllocationStatus::NotExists,
            FileAllocationStatus::ExistsCorrectSize,
            FileAllocationStatus::ExistsTooLarge,
            FileAllocationStatus::ExistsTooSmall,
            FileAllocationStatus::ToBeDeleted,
        ] {
            assert_eq!(FileAllocationStatus::try_from(status as u8), Ok(status));
        }
        assert_eq!(FileAllocationStatus::try_from(9), Err(9));
    }

    #[test]
    fn test_merge_chunks() {
        let mut info = FileChunksInfo::new(1, "a", 100);
        info.add_chunk(Interval::new(20, 30));
        info.add_chunk(Interval::new(0, 10));
        info.add_chunk(Interval::new(10, 15));
        info.add_chunk(Interval::new(25, 40));
        info.merge_chunks();
        assert_eq!(
            info.chunks,
            vec![Interval::new(0, 15), Interval::new(20, 40)]
        );
    }

    #[test]
    fn test_remaining_chunks() {
        let mut info = FileChunksInfo::new(1, "a", 100);
        info.add_chunk(Interval::new(10, 20));
        info.add_chunk(Interval::new(50, 60));
        let remaining = info.remaining_chunks(100);
        assert_eq!(
            remaining,
            vec![
                Interval::new(0, 10),
                Interval::new(20, 50),
                Interval::new(60, 100),
            ]
        );
    }

    #[test]
    fn test_remaining_chunks_file_shrunk() {
        // Receiver holds a range past the current end of the file.
        let mut info = FileChunksInfo::new(1, "a", 100);
        info.add_chunk(Interval::new(0, 40));
        info.add_chunk(Interval::new(80, 100));
        let remaining = info.remaining_chunks(60);
        assert_eq!(remaining, vec![Interval::new(40, 60)]);
    }

    #[test]
    fn test_remaining_chunks_nothing_present() {
        let info = FileChunksInfo::new(1, "a", 100);
        assert_eq!(info.remaining_chunks(100), vec![Interval::new(0, 100)]);
    }

    #[test]
    fn test_remaining_chunks_everything_present() {
        let mut info = FileChunksInfo::new(1, "a", 100);
        info.add_chunk(Interval::new(0, 100));
        assert!(info.remaining_chunks(100).is_empty());
    }
}
