//! Directory source queue: discovers files, partitions them into blocks and
//! hands byte sources out to sender threads.

use crate::byte_source::FileByteSource;
use crate::metadata::{
    FileAllocationStatus, FileChunksInfo, Interval, SourceMetaData, WdtFileInfo,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// Interval between abort-flag polls while a consumer waits for work
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Health of the discovery side, conveyed to the receiver in block headers
/// and the final DONE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueStatus {
    /// Discovery and source opening have not failed
    #[default]
    Ok,
    /// At least one source failed to open or discovery hit an error
    SourceError,
}

/// Configuration for a [`DirectorySourceQueue`]
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Follow symlinks during discovery
    pub follow_symlinks: bool,
    /// Block size in bytes; 0 disables block mode (one block per file)
    pub block_size: u64,
    /// Read all sources with direct I/O
    pub direct_reads: bool,
    /// Explicit file list; when set, directory traversal is skipped
    pub explicit_files: Option<Vec<WdtFileInfo>>,
    /// Wait for the resumption manifest before partitioning files
    pub expect_manifest: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            block_size: 16 * 1024 * 1024,
            direct_reads: false,
            explicit_files: None,
            expect_manifest: false,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    blocks: VecDeque<FileByteSource>,
    discovery_finished: bool,
    total_size: u64,
    num_blocks_discovered: u64,
    status: QueueStatus,
    next_seq_id: i64,
    /// Manifest entries keyed by relative path; set at most once
    manifest: Option<HashMap<String, FileChunksInfo>>,
    /// Manifest entries not yet matched to a source file
    unseen_manifest: HashMap<String, FileChunksInfo>,
    /// Sources that failed to open: (identifier, data size)
    failed: Vec<(String, u64)>,
}

/// Thread-safe queue of byte sources backed by directory discovery.
///
/// Discovery runs on its own thread via [`discover`](Self::discover);
/// consumers block in [`get_next_source`](Self::get_next_source) until a
/// block is available or discovery ends. Sources that the receiver did not
/// acknowledge are pushed back through
/// [`return_to_queue`](Self::return_to_queue) for retransmission.
pub struct DirectorySourceQueue {
    root_dir: PathBuf,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    cond: Condvar,
    should_abort: Box<dyn Fn() -> bool + Send + Sync>,
}

impl DirectorySourceQueue {
    /// Create a queue rooted at `root_dir`.
    ///
    /// `should_abort` is polled by discovery and by waiting consumers; once
    /// it returns true the queue stops producing work promptly.
    #[must_use]
    pub fn new(
        root_dir: impl Into<PathBuf>,
        config: QueueConfig,
        should_abort: Box<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            config,
            inner: Mutex::new(QueueInner::default()),
            cond: Condvar::new(),
            should_abort,
        }
    }

    /// Run file discovery to completion.
    ///
    /// When the queue expects a resumption manifest, discovery first waits
    /// for [`set_file_chunks_info`](Self::set_file_chunks_info) so that
    /// already-present byte ranges can be skipped while partitioning.
    pub fn discover(&self) {
        if self.config.expect_manifest {
            let mut inner = self.inner.lock().unwrap();
            while inner.manifest.is_none() && !(self.should_abort)() {
                let (guard, _) = self.cond.wait_timeout(inner, WAIT_INTERVAL).unwrap();
                inner = guard;
            }
            drop(inner);
        }

        if let Some(files) = self.config.explicit_files.clone() {
            self.enumerate_explicit(&files);
        } else {
            let root = self.root_dir.clone();
            self.walk_dir(&root);
        }
        self.enqueue_deletions();

        let mut inner = self.inner.lock().unwrap();
        inner.discovery_finished = true;
        info!(
            num_blocks = inner.num_blocks_discovered,
            total_size = inner.total_size,
            "file discovery finished"
        );
        drop(inner);
        self.cond.notify_all();
    }

    /// Pop the next byte source, opened and ready to stream.
    ///
    /// Blocks while discovery is still running and the queue is empty.
    /// Returns `None` once the queue is drained and discovery has finished,
    /// or when the abort hook fires. The returned status conveys
    /// discovery-side failures for the block header.
    pub fn get_next_source(&self) -> (Option<FileByteSource>, QueueStatus) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if (self.should_abort)() {
                return (None, inner.status);
            }
            if let Some(mut source) = inner.blocks.pop_front() {
                let status = inner.status;
                drop(inner);
                match source.open() {
                    Ok(()) => return (Some(source), status),
                    Err(err) => {
                        error!(id = source.identifier(), %err, "failed to open source");
                        inner = self.inner.lock().unwrap();
                        inner.status = QueueStatus::SourceError;
                        inner
                            .failed
                            .push((source.identifier().to_string(), source.size()));
                        continue;
                    }
                }
            }
            if inner.discovery_finished {
                return (None, inner.status);
            }
            let (guard, _) = self.cond.wait_timeout(inner, WAIT_INTERVAL).unwrap();
            inner = guard;
        }
    }

    /// Push unacknowledged sources back for retransmission
    pub fn return_to_queue(&self, sources: Vec<FileByteSource>) {
        if sources.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for mut source in sources {
            debug!(
                id = source.identifier(),
                offset = source.offset(),
                size = source.size(),
                "returning source to queue"
            );
            source.close();
            inner.blocks.push_back(source);
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Whether discovery has completed
    #[must_use]
    pub fn file_discovery_finished(&self) -> bool {
        self.inner.lock().unwrap().discovery_finished
    }

    /// Total number of data bytes queued for sending
    #[must_use]
    pub fn get_total_size(&self) -> u64 {
        self.inner.lock().unwrap().total_size
    }

    /// Number of blocks discovered so far and the discovery status
    #[must_use]
    pub fn get_num_blocks_and_status(&self) -> (u64, QueueStatus) {
        let inner = self.inner.lock().unwrap();
        (inner.num_blocks_discovered, inner.status)
    }

    /// Install the resumption manifest delivered by the receiver.
    ///
    /// Only the first call has any effect; the queue uses the manifest to
    /// skip byte ranges the receiver already holds and to schedule deletion
    /// of receiver files that no longer exist at the source.
    pub fn set_file_chunks_info(&self, chunks: Vec<FileChunksInfo>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.manifest.is_some() {
            return;
        }
        let map: HashMap<String, FileChunksInfo> = chunks
            .into_iter()
            .map(|info| (info.file_name.clone(), info))
            .collect();
        info!(num_files = map.len(), "received file chunks manifest");
        inner.unseen_manifest = map.clone();
        inner.manifest = Some(map);
        drop(inner);
        self.cond.notify_all();
    }

    /// Identifiers and sizes of sources that failed to open
    #[must_use]
    pub fn drain_failed_sources(&self) -> Vec<(String, u64)> {
        std::mem::take(&mut self.inner.lock().unwrap().failed)
    }

    /// Identifiers and sizes of blocks still queued; used at report time
    /// when the transfer ends with unsent work
    #[must_use]
    pub fn drain_remaining(&self) -> Vec<(String, u64)> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .blocks
            .drain(..)
            .map(|s| (s.identifier().to_string(), s.size()))
            .collect()
    }

    fn enumerate_explicit(&self, files: &[WdtFileInfo]) {
        for info in files {
            let full = self.root_dir.join(&info.file_name);
            let size = match info.file_size {
                Some(size) => size,
                None => match std::fs::metadata(&full) {
                    Ok(md) => md.len(),
                    Err(err) => {
                        error!(path = %full.display(), %err, "cannot stat file");
                        self.inner.lock().unwrap().status = QueueStatus::SourceError;
                        continue;
                    }
                },
            };
            let direct = info.direct_reads || self.config.direct_reads;
            self.enqueue_file(info.file_name.clone(), full, size, direct);
            if (self.should_abort)() {
                return;
            }
        }
    }

    fn walk_dir(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!(path = %dir.display(), %err, "cannot read directory");
                self.inner.lock().unwrap().status = QueueStatus::SourceError;
                return;
            }
        };
        for entry in entries {
            if (self.should_abort)() {
                return;
            }
            let Ok(entry) = entry else {
                self.inner.lock().unwrap().status = QueueStatus::SourceError;
                continue;
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(err) => {
                    error!(path = %path.display(), %err, "cannot stat entry");
                    self.inner.lock().unwrap().status = QueueStatus::SourceError;
                    continue;
                }
            };
            if file_type.is_symlink() && !self.config.follow_symlinks {
                debug!(path = %path.display(), "skipping symlink");
                continue;
            }
            // Resolve through the symlink when following.
            let resolved = if file_type.is_symlink() {
                match std::fs::metadata(&path) {
                    Ok(md) => md,
                    Err(err) => {
                        error!(path = %path.display(), %err, "broken symlink");
                        self.inner.lock().unwrap().status = QueueStatus::SourceError;
                        continue;
                    }
                }
            } else {
                match entry.metadata() {
                    Ok(md) => md,
                    Err(err) => {
                        error!(path = %path.display(), %err, "cannot stat entry");
                        self.inner.lock().unwrap().status = QueueStatus::SourceError;
                        continue;
                    }
                }
            };
            if resolved.is_dir() {
                self.walk_dir(&path);
            } else if resolved.is_file() {
                let rel = path
                    .strip_prefix(&self.root_dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                self.enqueue_file(rel, path, resolved.len(), self.config.direct_reads);
            }
        }
    }

    fn enqueue_file(&self, rel_path: String, full_path: PathBuf, size: u64, direct_reads: bool) {
        let mut inner = self.inner.lock().unwrap();
        let manifest_entry = inner.unseen_manifest.remove(&rel_path);
        let (allocation_status, prev_seq_id, ranges) = match manifest_entry {
            Some(info) => {
                let status = if info.file_size == size {
                    FileAllocationStatus::ExistsCorrectSize
                } else if info.file_size > size {
                    FileAllocationStatus::ExistsTooLarge
                } else {
                    FileAllocationStatus::ExistsTooSmall
                };
                (status, info.seq_id, info.remaining_chunks(size))
            }
            None => {
                let ranges = if size == 0 {
                    // Empty files still travel as one zero-size block so the
                    // receiver creates them.
                    vec![Interval::new(0, 0)]
                } else {
                    vec![Interval::new(0, size)]
                };
                (FileAllocationStatus::NotExists, -1, ranges)
            }
        };
        if ranges.is_empty() {
            debug!(rel_path, "receiver already holds the whole file");
            return;
        }
        let seq_id = inner.next_seq_id;
        inner.next_seq_id += 1;
        let metadata = Arc::new(SourceMetaData {
            rel_path,
            full_path,
            size,
            seq_id,
            prev_seq_id,
            allocation_status,
            file: None,
            direct_reads,
        });
        for range in ranges {
            self.enqueue_range(&mut inner, &metadata, range);
        }
        drop(inner);
        self.cond.notify_all();
    }

    fn enqueue_range(
        &self,
        inner: &mut QueueInner,
        metadata: &Arc<SourceMetaData>,
        range: Interval,
    ) {
        let block_size = self.config.block_size;
        let mut offset = range.start;
        loop {
            let len = if block_size == 0 {
                range.end - offset
            } else {
                (range.end - offset).min(block_size)
            };
            inner
                .blocks
                .push_back(FileByteSource::new(Arc::clone(metadata), offset, len));
            inner.num_blocks_discovered += 1;
            inner.total_size += len;
            offset += len;
            if offset >= range.end {
                break;
            }
        }
    }

    /// Schedule deletion of receiver files absent from the source tree
    fn enqueue_deletions(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.manifest.is_none() || inner.unseen_manifest.is_empty() {
            return;
        }
        let unseen = std::mem::take(&mut inner.unseen_manifest);
        for (name, info) in unseen {
            info!(file = name, "scheduling deletion on receiver");
            let seq_id = inner.next_seq_id;
            inner.next_seq_id += 1;
            let metadata = Arc::new(SourceMetaData {
                rel_path: name.clone(),
                full_path: self.root_dir.join(&name),
                size: 0,
                seq_id,
                prev_seq_id: info.seq_id,
                allocation_status: FileAllocationStatus::ToBeDeleted,
                file: None,
                direct_reads: false,
            });
            inner
                .blocks
                .push_back(FileByteSource::new(metadata, 0, 0));
            inner.num_blocks_discovered += 1;
        }
        drop(inner);
        self.cond.notify_all();
    }
}
