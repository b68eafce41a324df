//! Page-aligned read buffer.
//!
//! Direct I/O (`O_DIRECT`) requires the destination buffer, the file offset
//! and the read length to all be multiples of the disk block size. The
//! buffer is owned by the sender thread and loaned to byte sources for the
//! duration of one `read` call.

use crate::DISK_BLOCK_SIZE;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Heap buffer aligned to the disk block size.
///
/// The requested size is rounded up to a whole number of disk blocks so the
/// full buffer is always usable for aligned physical reads.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
}

// The buffer is a plain owned allocation; it moves with its owning thread.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a buffer of at least `size` bytes, aligned to the disk block
    /// size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the allocation fails; buffer allocation
    /// happens once per sender thread at startup, before any transfer work.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "buffer size must be non-zero");
        let block = DISK_BLOCK_SIZE as usize;
        let size = size.div_ceil(block) * block;
        let layout = Layout::from_size_align(size, block).expect("invalid buffer layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, size }
    }

    /// Buffer size in bytes (a multiple of the disk block size)
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the buffer is empty (never true; kept for slice-like API)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// View the buffer as a byte slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// View the buffer as a mutable byte slice
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and we hold &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, DISK_BLOCK_SIZE as usize)
            .expect("invalid buffer layout");
        // SAFETY: ptr was allocated with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_rounded_to_disk_block() {
        let buf = AlignedBuffer::new(1000);
        assert_eq!(buf.len(), DISK_BLOCK_SIZE as usize);

        let buf = AlignedBuffer::new(DISK_BLOCK_SIZE as usize * 3);
        assert_eq!(buf.len(), DISK_BLOCK_SIZE as usize * 3);
    }

    #[test]
    fn test_buffer_is_aligned() {
        let buf = AlignedBuffer::new(64 * 1024);
        assert_eq!(buf.as_slice().as_ptr() as usize % DISK_BLOCK_SIZE as usize, 0);
    }

    #[test]
    fn test_buffer_read_write() {
        let mut buf = AlignedBuffer::new(8192);
        buf.as_mut_slice()[0] = 0xAB;
        buf.as_mut_slice()[8191] = 0xCD;
        assert_eq!(buf.as_slice()[0], 0xAB);
        assert_eq!(buf.as_slice()[8191], 0xCD);
    }
}
