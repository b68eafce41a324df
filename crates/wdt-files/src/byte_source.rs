//! Byte sources: one block of a file with an open descriptor and a read
//! cursor, streamed through the thread's aligned buffer.

use crate::DISK_BLOCK_SIZE;
use crate::buffer::AlignedBuffer;
use crate::metadata::{FileAllocationStatus, SourceMetaData};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Errors produced while opening or reading a byte source
#[derive(Debug, Error)]
pub enum SourceError {
    /// The file could not be opened
    #[error("failed to open {path}: {source}")]
    Open {
        /// Path of the file
        path: String,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A read from the file failed
    #[error("failed to read {path} at offset {offset}: {source}")]
    Read {
        /// Path of the file
        path: String,
        /// Absolute file offset of the failed read
        offset: u64,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The file ended before the block was fully read
    #[error("unexpected eof on {path}: read {bytes_read} of {expected} bytes")]
    UnexpectedEof {
        /// Path of the file
        path: String,
        /// Bytes read so far
        bytes_read: u64,
        /// Bytes the block was expected to contain
        expected: u64,
    },

    /// Direct reads were requested but the platform supports neither
    /// `O_DIRECT` nor `F_NOCACHE`
    #[error("direct reads requested for {path} but not supported on this platform")]
    DirectUnsupported {
        /// Path of the file
        path: String,
    },
}

/// How the platform can bypass the page cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectIoMode {
    /// `O_DIRECT` open flag; reads must be block-aligned
    ODirect,
    /// `F_NOCACHE` fcntl; no alignment requirement
    NoCache,
    /// No uncached I/O available
    Unsupported,
}

/// Effective direct-I/O mode for this platform
#[must_use]
pub const fn direct_io_mode() -> DirectIoMode {
    #[cfg(target_os = "linux")]
    {
        DirectIoMode::ODirect
    }
    #[cfg(target_os = "macos")]
    {
        DirectIoMode::NoCache
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        DirectIoMode::Unsupported
    }
}

/// Open a file read-only, optionally bypassing the page cache.
///
/// # Errors
///
/// Returns [`SourceError::DirectUnsupported`] when `direct_reads` is set on
/// a platform with no uncached-I/O primitive, or [`SourceError::Open`] when
/// the open itself fails.
pub fn open_for_read(path: &Path, direct_reads: bool) -> Result<File, SourceError> {
    let mut options = OpenOptions::new();
    options.read(true);
    if direct_reads {
        match direct_io_mode() {
            DirectIoMode::ODirect => {
                #[cfg(target_os = "linux")]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.custom_flags(libc::O_DIRECT);
                }
            }
            DirectIoMode::NoCache => {}
            DirectIoMode::Unsupported => {
                return Err(SourceError::DirectUnsupported {
                    path: path.display().to_string(),
                });
            }
        }
    }
    let file = options.open(path).map_err(|source| SourceError::Open {
        path: path.display().to_string(),
        source,
    })?;
    #[cfg(target_os = "macos")]
    if direct_reads {
        use std::os::fd::AsRawFd;
        // SAFETY: fd is a valid open descriptor owned by `file`.
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if ret != 0 {
            error!(path = %path.display(), "unable to set F_NOCACHE");
        }
    }
    Ok(file)
}

/// One block of a file together with an open descriptor and a read cursor.
///
/// Created by the directory queue, opened by the sender thread before the
/// first read and closed after transmission or on failure. The data buffer
/// is owned by the thread, not the source; a returned slice is valid until
/// the next `read` on the same buffer.
#[derive(Debug)]
pub struct FileByteSource {
    metadata: Arc<SourceMetaData>,
    /// Block start offset within the file; advanced on checkpoint resumption
    offset: u64,
    /// Remaining data size of the block
    size: u64,
    bytes_read: u64,
    aligned_read_needed: bool,
    file: Option<Arc<File>>,
}

impl FileByteSource {
    /// Create a byte source for `size` bytes of the file starting at
    /// `offset`
    #[must_use]
    pub fn new(metadata: Arc<SourceMetaData>, offset: u64, size: u64) -> Self {
        Self {
            metadata,
            offset,
            size,
            bytes_read: 0,
            aligned_read_needed: false,
            file: None,
        }
    }

    /// Metadata of the backing file
    #[must_use]
    pub fn metadata(&self) -> &SourceMetaData {
        &self.metadata
    }

    /// Identifier used in logs and reports
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.metadata.rel_path
    }

    /// Block start offset within the file
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Remaining data size of the block
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes consumed so far by `read`
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether the block is fully read
    #[must_use]
    pub fn finished(&self) -> bool {
        self.bytes_read == self.size
    }

    /// Shrink the block from the front, used when the receiver already holds
    /// the first `num_bytes` bytes of it
    pub fn advance_offset(&mut self, num_bytes: u64) {
        debug_assert!(num_bytes <= self.size);
        self.offset += num_bytes;
        self.size -= num_bytes;
    }

    /// Open the backing file.
    ///
    /// A no-op for `ToBeDeleted` entries. Reuses the descriptor carried by
    /// the metadata when present, otherwise opens the file honouring the
    /// direct-reads flag.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the file cannot be opened or direct
    /// reads are unsupported.
    pub fn open(&mut self) -> Result<(), SourceError> {
        if self.metadata.allocation_status == FileAllocationStatus::ToBeDeleted {
            return Ok(());
        }
        self.bytes_read = 0;
        self.file = None;
        let direct = self.metadata.direct_reads;
        if direct && direct_io_mode() == DirectIoMode::ODirect {
            self.aligned_read_needed = true;
        }
        if let Some(file) = &self.metadata.file {
            debug!(id = self.identifier(), "reusing pre-opened descriptor");
            self.file = Some(Arc::clone(file));
            return Ok(());
        }
        let file = open_for_read(&self.metadata.full_path, direct)?;
        self.file = Some(Arc::new(file));
        Ok(())
    }

    /// Close the backing file; dropping the last handle releases the
    /// descriptor
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Read the next slice of the block into `buf`.
    ///
    /// Returns `Ok(None)` once the block is fully read. When the aligned
    /// read path is active, the physical read is issued on disk-block
    /// boundaries and the returned slice is trimmed to the logical window.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Read`] on I/O failure and
    /// [`SourceError::UnexpectedEof`] when the file ends before the block
    /// does; both close the file.
    pub fn read<'a>(
        &mut self,
        buf: &'a mut AlignedBuffer,
    ) -> Result<Option<&'a [u8]>, SourceError> {
        use std::os::unix::fs::FileExt;

        if self.finished() {
            return Ok(None);
        }
        let Some(file) = self.file.clone() else {
            return Err(SourceError::Read {
                path: self.metadata.full_path.display().to_string(),
                offset: self.offset + self.bytes_read,
                source: io::Error::new(io::ErrorKind::NotFound, "source not open"),
            });
        };

        let cursor = self.offset + self.bytes_read;
        let offset_remainder = if self.aligned_read_needed {
            cursor % DISK_BLOCK_SIZE
        } else {
            0
        };
        let logical = (buf.len() as u64 - offset_remainder).min(self.size - self.bytes_read);
        let physical = if self.aligned_read_needed {
            (logical + offset_remainder).div_ceil(DISK_BLOCK_SIZE) * DISK_BLOCK_SIZE
        } else {
            logical
        };
        let seek_pos = cursor - offset_remainder;

        let num_read = match file.read_at(&mut buf.as_mut_slice()[..physical as usize], seek_pos) {
            Ok(n) => n as u64,
            Err(source) => {
                error!(
                    path = %self.metadata.full_path.display(),
                    aligned = self.aligned_read_needed,
                    physical,
                    seek_pos,
                    offset_remainder,
                    bytes_read = self.bytes_read,
                    "read failure"
                );
                self.close();
                return Err(SourceError::Read {
                    path: self.metadata.full_path.display().to_string(),
                    offset: seek_pos,
                    source,
                });
            }
        };
        if num_read <= offset_remainder {
            self.close();
            return Err(SourceError::UnexpectedEof {
                path: self.metadata.full_path.display().to_string(),
                bytes_read: self.bytes_read,
                expected: self.size,
            });
        }
        // The physical read can overshoot the logical window when reading the
        // aligned tail of the file.
        let mut len = num_read - offset_remainder;
        if len > logical {
            debug_assert!(self.aligned_read_needed);
            len = logical;
        }
        self.bytes_read += len;
        let start = offset_remainder as usize;
        Ok(Some(&buf.as_slice()[start..start + len as usize]))
    }

    #[cfg(test)]
    pub(crate) fn set_aligned(&mut self, aligned: bool) {
        self.aligned_read_needed = aligned;
    }
}
