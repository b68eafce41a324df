//! # WDT Files
//!
//! File-side building blocks for the WDT sender:
//! - Page-aligned read buffers for direct I/O
//! - File metadata and the resumption manifest types
//! - Byte sources that stream a block of a file through an aligned read path
//! - The directory source queue that discovers files, partitions them into
//!   blocks and hands them out to sender threads

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod byte_source;
pub mod metadata;
pub mod queue;

pub use buffer::AlignedBuffer;
pub use byte_source::{DirectIoMode, FileByteSource, SourceError, direct_io_mode, open_for_read};
pub use metadata::{
    FileAllocationStatus, FileChunksInfo, Interval, SourceMetaData, WdtFileInfo,
};
pub use queue::{DirectorySourceQueue, QueueConfig, QueueStatus};

/// Disk block size used for aligned reads and block rounding
pub const DISK_BLOCK_SIZE: u64 = 4 * 1024;
