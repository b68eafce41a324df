//! Per-thread transfer history: the ledger of dispatched byte sources and
//! the checkpoint machinery built on it.

use crate::error::ErrorCode;
use crate::protocol::Checkpoint;
use crate::report::TransferStats;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use wdt_files::{DirectorySourceQueue, FileByteSource};

/// Outcome of applying a checkpoint to a history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointApply {
    /// The checkpoint extended the acknowledged prefix or the partial-byte
    /// watermark
    Progress,
    /// The checkpoint matched what was already acknowledged
    NoProgress,
    /// The checkpoint does not fit this history
    Invalid,
}

struct Entry {
    id: String,
    source: Option<FileByteSource>,
}

/// Ordered ledger of the sources handed to one thread.
///
/// The acknowledged prefix only ever grows. Sources past the prefix are
/// in flight; on reconnect or on a global checkpoint they go back to the
/// queue for retransmission, and whatever is still unacknowledged when the
/// thread dies is reported as failed.
pub struct ThreadTransferHistory {
    queue: Arc<DirectorySourceQueue>,
    port: i32,
    entries: Vec<Entry>,
    num_acknowledged: usize,
    /// Bytes of the first unacknowledged block already held by the
    /// receiver; makes re-applying the same checkpoint a no-op
    partial_applied: u64,
    global_checkpoint: bool,
    pending_global: Option<Checkpoint>,
    in_use: bool,
}

impl ThreadTransferHistory {
    fn new(queue: Arc<DirectorySourceQueue>, port: i32) -> Self {
        Self {
            queue,
            port,
            entries: Vec::new(),
            num_acknowledged: 0,
            partial_applied: 0,
            global_checkpoint: false,
            pending_global: None,
            in_use: true,
        }
    }

    /// Record a dispatched source. Returns false once a global checkpoint
    /// has claimed this history; the source goes straight back to the
    /// queue and the caller must stop.
    pub fn add_source(&mut self, source: FileByteSource) -> bool {
        if self.global_checkpoint {
            warn!(
                port = self.port,
                id = source.identifier(),
                "history claimed by global checkpoint, requeueing source"
            );
            self.queue.return_to_queue(vec![source]);
            return false;
        }
        self.entries.push(Entry {
            id: source.identifier().to_string(),
            source: Some(source),
        });
        true
    }

    /// Apply a receiver-reported checkpoint observed on reconnect
    pub fn set_local_checkpoint(&mut self, checkpoint: Checkpoint) -> CheckpointApply {
        self.apply_checkpoint(checkpoint)
    }

    /// The receiver acknowledged every source dispatched so far
    pub fn mark_all_acknowledged(&mut self) {
        for entry in &mut self.entries[self.num_acknowledged..] {
            entry.source = None;
        }
        self.num_acknowledged = self.entries.len();
        self.partial_applied = 0;
    }

    /// Route a global checkpoint to this history.
    ///
    /// While the owning thread is live the application is deferred to
    /// [`mark_not_in_use`](Self::mark_not_in_use); the raised flag forces
    /// the thread off at its next state boundary.
    pub fn handle_global_checkpoint(&mut self, checkpoint: Checkpoint) {
        info!(port = self.port, %checkpoint, "received global checkpoint");
        self.global_checkpoint = true;
        if self.in_use {
            self.pending_global = Some(checkpoint);
        } else {
            let result = self.apply_checkpoint(checkpoint);
            if result == CheckpointApply::Invalid {
                error!(port = self.port, %checkpoint, "invalid global checkpoint ignored");
            }
        }
    }

    /// Whether a global checkpoint has claimed this history
    #[must_use]
    pub fn is_global_checkpoint_received(&self) -> bool {
        self.global_checkpoint
    }

    /// The owning thread is done with this history; a deferred global
    /// checkpoint is applied now
    pub fn mark_not_in_use(&mut self) {
        self.in_use = false;
        if let Some(checkpoint) = self.pending_global.take() {
            let result = self.apply_checkpoint(checkpoint);
            if result == CheckpointApply::Invalid {
                error!(port = self.port, %checkpoint, "invalid deferred global checkpoint");
            }
        }
    }

    /// Roll the history back for a protocol-version change: everything
    /// outstanding returns to the queue and the ledger resets, because the
    /// receiver restarts its session.
    fn rollback_for_version_change(&mut self) -> Result<(), ErrorCode> {
        if self.pending_global.is_some() {
            // A deferred global checkpoint and a version change cannot both
            // be honoured.
            return Err(ErrorCode::InvalidCheckpoint);
        }
        let outstanding: Vec<FileByteSource> = self
            .entries
            .drain(..)
            .filter_map(|entry| entry.source)
            .collect();
        self.queue.return_to_queue(outstanding);
        self.num_acknowledged = 0;
        self.partial_applied = 0;
        self.global_checkpoint = false;
        Ok(())
    }

    /// Identifier of the source at `index`, for abort diagnostics
    #[must_use]
    pub fn source_id(&self, index: i64) -> String {
        usize::try_from(index)
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .map(|entry| entry.id.clone())
            .unwrap_or_default()
    }

    /// Number of acknowledged sources
    #[must_use]
    pub fn num_acknowledged(&self) -> usize {
        self.num_acknowledged
    }

    /// Number of dispatched but unacknowledged sources
    #[must_use]
    pub fn num_in_flight(&self) -> usize {
        self.entries.len() - self.num_acknowledged
    }

    fn drain_failed(&mut self) -> Vec<TransferStats> {
        self.entries
            .drain(self.num_acknowledged..)
            .map(|entry| {
                let mut stats = TransferStats::with_id(entry.id);
                stats.incr_failed_attempts();
                stats
            })
            .collect()
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) -> CheckpointApply {
        let Ok(num_blocks) = usize::try_from(checkpoint.num_blocks) else {
            return CheckpointApply::Invalid;
        };
        if num_blocks < self.num_acknowledged || num_blocks > self.entries.len() {
            error!(
                port = self.port,
                %checkpoint,
                num_acknowledged = self.num_acknowledged,
                history_len = self.entries.len(),
                "checkpoint does not fit history"
            );
            return CheckpointApply::Invalid;
        }
        let Ok(partial) = u64::try_from(checkpoint.last_block_received_bytes) else {
            return CheckpointApply::Invalid;
        };

        // Validate the partial advance before mutating anything.
        let prior_partial = if num_blocks > self.num_acknowledged {
            0
        } else {
            self.partial_applied
        };
        let partial_delta = partial.saturating_sub(prior_partial);
        if partial_delta > 0 {
            let Some(entry) = self.entries.get(num_blocks) else {
                return CheckpointApply::Invalid;
            };
            match &entry.source {
                Some(source) if partial_delta <= source.size() => {}
                _ => return CheckpointApply::Invalid,
            }
        }

        let progress = num_blocks > self.num_acknowledged || partial_delta > 0;
        for entry in &mut self.entries[self.num_acknowledged..num_blocks] {
            entry.source = None;
        }
        if num_blocks > self.num_acknowledged {
            self.num_acknowledged = num_blocks;
            self.partial_applied = 0;
        }
        if partial_delta > 0 {
            let source = self.entries[num_blocks]
                .source
                .as_mut()
                .expect("validated above");
            source.advance_offset(partial_delta);
            self.partial_applied = partial;
        }

        // Everything past the acknowledged prefix was cut off by the
        // reconnect and must be retransmitted.
        let outstanding: Vec<FileByteSource> = self
            .entries
            .drain(self.num_acknowledged..)
            .filter_map(|entry| entry.source)
            .collect();
        self.queue.return_to_queue(outstanding);

        if progress {
            CheckpointApply::Progress
        } else {
            CheckpointApply::NoProgress
        }
    }
}

/// Owner of every thread's history, routing global events across them.
pub struct TransferHistoryController {
    histories: HashMap<i32, Mutex<ThreadTransferHistory>>,
}

impl TransferHistoryController {
    /// One history per configured port
    #[must_use]
    pub fn new(queue: &Arc<DirectorySourceQueue>, ports: &[u16]) -> Self {
        let histories = ports
            .iter()
            .map(|&port| {
                let port = i32::from(port);
                (
                    port,
                    Mutex::new(ThreadTransferHistory::new(Arc::clone(queue), port)),
                )
            })
            .collect();
        Self { histories }
    }

    fn with_history<R>(&self, port: i32, f: impl FnOnce(&mut ThreadTransferHistory) -> R) -> R {
        let mut history = self
            .histories
            .get(&port)
            .expect("unknown port")
            .lock()
            .unwrap();
        f(&mut history)
    }

    /// See [`ThreadTransferHistory::add_source`]
    pub fn add_source(&self, port: i32, source: FileByteSource) -> bool {
        self.with_history(port, |h| h.add_source(source))
    }

    /// See [`ThreadTransferHistory::set_local_checkpoint`]
    pub fn set_local_checkpoint(&self, port: i32, checkpoint: Checkpoint) -> CheckpointApply {
        self.with_history(port, |h| h.set_local_checkpoint(checkpoint))
    }

    /// See [`ThreadTransferHistory::mark_all_acknowledged`]
    pub fn mark_all_acknowledged(&self, port: i32) {
        self.with_history(port, ThreadTransferHistory::mark_all_acknowledged);
    }

    /// Route a global checkpoint to the history it targets, even when that
    /// thread already died.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ProtocolError`] when the checkpoint names an
    /// unknown port.
    pub fn handle_global_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), ErrorCode> {
        let Some(history) = self.histories.get(&checkpoint.port) else {
            error!(%checkpoint, "global checkpoint for unknown port");
            return Err(ErrorCode::ProtocolError);
        };
        history.lock().unwrap().handle_global_checkpoint(checkpoint);
        Ok(())
    }

    /// Roll every history back for a protocol-version change.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InvalidCheckpoint`] when a history holds a
    /// deferred global checkpoint that would be lost.
    pub fn handle_version_mismatch(&self) -> Result<(), ErrorCode> {
        for history in self.histories.values() {
            history.lock().unwrap().rollback_for_version_change()?;
        }
        Ok(())
    }

    /// See [`ThreadTransferHistory::is_global_checkpoint_received`]
    #[must_use]
    pub fn is_global_checkpoint_received(&self, port: i32) -> bool {
        self.with_history(port, |h| h.is_global_checkpoint_received())
    }

    /// See [`ThreadTransferHistory::mark_not_in_use`]
    pub fn mark_not_in_use(&self, port: i32) {
        self.with_history(port, ThreadTransferHistory::mark_not_in_use);
    }

    /// See [`ThreadTransferHistory::source_id`]
    #[must_use]
    pub fn source_id(&self, port: i32, index: i64) -> String {
        self.with_history(port, |h| h.source_id(index))
    }

    /// Acknowledged sources summed over all threads
    #[must_use]
    pub fn num_acknowledged_total(&self) -> usize {
        self.histories
            .values()
            .map(|h| h.lock().unwrap().num_acknowledged())
            .sum()
    }

    /// Collect the never-acknowledged sources of all threads for the final
    /// report
    #[must_use]
    pub fn drain_failed_sources(&self) -> Vec<TransferStats> {
        self.histories
            .values()
            .flat_map(|h| h.lock().unwrap().drain_failed())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wdt_files::{FileAllocationStatus, QueueConfig, SourceMetaData};

    fn empty_queue() -> (TempDir, Arc<DirectorySourceQueue>) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(DirectorySourceQueue::new(
            dir.path(),
            QueueConfig::default(),
            Box::new(|| false),
        ));
        queue.discover();
        (dir, queue)
    }

    fn source(name: &str, size: u64) -> FileByteSource {
        let metadata = Arc::new(SourceMetaData {
            rel_path: name.to_string(),
            full_path: PathBuf::from("/nonexistent").join(name),
            size,
            seq_id: 0,
            prev_seq_id: -1,
            allocation_status: FileAllocationStatus::NotExists,
            file: None,
            direct_reads: false,
        });
        FileByteSource::new(metadata, 0, size)
    }

    fn checkpoint(num_blocks: i64, partial: i64) -> Checkpoint {
        Checkpoint {
            port: 1,
            num_blocks,
            last_block_received_bytes: partial,
        }
    }

    fn controller_with_sources(
        names: &[(&str, u64)],
    ) -> (TempDir, Arc<DirectorySourceQueue>, TransferHistoryController) {
        let (dir, queue) = empty_queue();
        let controller = TransferHistoryController::new(&queue, &[1]);
        for (name, size) in names {
            assert!(controller.add_source(1, source(name, *size)));
        }
        (dir, queue, controller)
    }

    #[test]
    fn test_mark_all_acknowledged() {
        let (_dir, _queue, controller) =
            controller_with_sources(&[("a", 10), ("b", 20), ("c", 30)]);
        controller.mark_all_acknowledged(1);
        assert_eq!(controller.num_acknowledged_total(), 3);
        assert!(controller.drain_failed_sources().is_empty());
    }

    #[test]
    fn test_local_checkpoint_progress_and_requeue() {
        let (_dir, queue, controller) =
            controller_with_sources(&[("a", 100), ("b", 200), ("c", 300)]);

        // Receiver holds block a fully plus 50 bytes of b.
        let result = controller.set_local_checkpoint(1, checkpoint(1, 50));
        assert_eq!(result, CheckpointApply::Progress);
        assert_eq!(controller.num_acknowledged_total(), 1);

        let requeued = queue.drain_remaining();
        assert_eq!(requeued.len(), 2);
        // Block b shrank by the 50 partial bytes.
        let b = requeued.iter().find(|(id, _)| id == "b").unwrap();
        assert_eq!(b.1, 150);
        let c = requeued.iter().find(|(id, _)| id == "c").unwrap();
        assert_eq!(c.1, 300);
    }

    #[test]
    fn test_same_checkpoint_twice_is_noop() {
        let (_dir, queue, controller) = controller_with_sources(&[("a", 100), ("b", 200)]);

        assert_eq!(
            controller.set_local_checkpoint(1, checkpoint(0, 64)),
            CheckpointApply::Progress
        );
        let first = queue.drain_remaining();
        let a = first.iter().find(|(id, _)| id == "a").unwrap();
        assert_eq!(a.1, 36);

        // Identical checkpoint: no progress, nothing requeued, no further
        // offset advance possible.
        assert_eq!(
            controller.set_local_checkpoint(1, checkpoint(0, 64)),
            CheckpointApply::NoProgress
        );
        assert!(queue.drain_remaining().is_empty());
    }

    #[test]
    fn test_no_progress_still_requeues() {
        let (_dir, queue, controller) = controller_with_sources(&[("a", 100)]);
        assert_eq!(
            controller.set_local_checkpoint(1, checkpoint(0, 0)),
            CheckpointApply::NoProgress
        );
        assert_eq!(queue.drain_remaining().len(), 1);
    }

    #[test]
    fn test_invalid_checkpoint_past_history() {
        let (_dir, _queue, controller) = controller_with_sources(&[("a", 100)]);
        assert_eq!(
            controller.set_local_checkpoint(1, checkpoint(5, 0)),
            CheckpointApply::Invalid
        );
        assert_eq!(
            controller.set_local_checkpoint(1, checkpoint(1, 10)),
            CheckpointApply::Invalid
        );
    }

    #[test]
    fn test_checkpoint_cannot_shrink_prefix() {
        let (_dir, _queue, controller) = controller_with_sources(&[("a", 10), ("b", 10)]);
        controller.mark_all_acknowledged(1);
        assert_eq!(
            controller.set_local_checkpoint(1, checkpoint(1, 0)),
            CheckpointApply::Invalid
        );
    }

    #[test]
    fn test_global_checkpoint_deferred_while_in_use() {
        let (_dir, queue, controller) = controller_with_sources(&[("a", 100), ("b", 200)]);

        controller
            .handle_global_checkpoint(checkpoint(1, 0))
            .unwrap();
        assert!(controller.is_global_checkpoint_received(1));
        // Deferred: nothing requeued yet.
        assert!(queue.drain_remaining().is_empty());

        // New sources bounce back to the queue.
        assert!(!controller.add_source(1, source("c", 50)));
        assert_eq!(queue.drain_remaining().len(), 1);

        // Thread exit applies the pending checkpoint.
        controller.mark_not_in_use(1);
        assert_eq!(controller.num_acknowledged_total(), 1);
        let requeued = queue.drain_remaining();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].0, "b");
    }

    #[test]
    fn test_global_checkpoint_applies_when_not_in_use() {
        let (_dir, queue, controller) = controller_with_sources(&[("a", 100)]);
        controller.mark_not_in_use(1);
        controller
            .handle_global_checkpoint(checkpoint(0, 0))
            .unwrap();
        assert_eq!(queue.drain_remaining().len(), 1);
    }

    #[test]
    fn test_global_checkpoint_unknown_port() {
        let (_dir, _queue, controller) = controller_with_sources(&[("a", 100)]);
        let bad = Checkpoint {
            port: 99,
            num_blocks: 0,
            last_block_received_bytes: 0,
        };
        assert_eq!(
            controller.handle_global_checkpoint(bad),
            Err(ErrorCode::ProtocolError)
        );
    }

    #[test]
    fn test_version_mismatch_rolls_back() {
        let (_dir, queue, controller) = controller_with_sources(&[("a", 100), ("b", 200)]);
        controller.mark_all_acknowledged(1);
        assert!(controller.add_source(1, source("c", 300)));

        controller.handle_version_mismatch().unwrap();
        assert_eq!(controller.num_acknowledged_total(), 0);
        // Only the outstanding source comes back; acknowledged data stays
        // with the receiver.
        let requeued = queue.drain_remaining();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].0, "c");
    }

    #[test]
    fn test_drain_failed_reports_unacknowledged() {
        let (_dir, _queue, controller) = controller_with_sources(&[("a", 100), ("b", 200)]);
        controller.set_local_checkpoint(1, checkpoint(1, 0));
        assert!(controller.add_source(1, source("c", 50)));

        let failed = controller.drain_failed_sources();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id(), Some("c"));
    }

    #[test]
    fn test_source_id_lookup() {
        let (_dir, _queue, controller) = controller_with_sources(&[("a", 100), ("b", 200)]);
        assert_eq!(controller.source_id(1, 1), "b");
        assert_eq!(controller.source_id(1, 7), "");
        assert_eq!(controller.source_id(1, -1), "");
    }
}
