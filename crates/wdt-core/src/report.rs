//! Transfer statistics and the final report.

use crate::error::ErrorCode;
use std::time::Duration;
use wdt_transport::EncryptionType;

/// Byte and block counters for one thread or one source.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    id: Option<String>,
    header_bytes: u64,
    data_bytes: u64,
    effective_header_bytes: u64,
    effective_data_bytes: u64,
    num_blocks: u64,
    failed_attempts: u64,
    num_reconnects: u64,
    local_error: ErrorCode,
    remote_error: ErrorCode,
    encryption_type: EncryptionType,
}

impl TransferStats {
    /// Empty stats
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty stats tagged with a source identifier
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Source identifier, when these stats describe one source
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Count protocol overhead bytes written to the wire
    pub fn add_header_bytes(&mut self, bytes: u64) {
        self.header_bytes += bytes;
    }

    /// Count payload bytes written to the wire
    pub fn add_data_bytes(&mut self, bytes: u64) {
        self.data_bytes += bytes;
    }

    /// Count bytes that ended up in an acknowledged block
    pub fn add_effective_bytes(&mut self, header: u64, data: u64) {
        self.effective_header_bytes += header;
        self.effective_data_bytes += data;
    }

    /// Count one transmitted block
    pub fn incr_num_blocks(&mut self) {
        self.num_blocks += 1;
    }

    /// Count one failed block attempt
    pub fn incr_failed_attempts(&mut self) {
        self.failed_attempts += 1;
    }

    /// Count one reconnect
    pub fn incr_num_reconnects(&mut self) {
        self.num_reconnects += 1;
    }

    /// Header bytes written so far
    #[must_use]
    pub fn header_bytes(&self) -> u64 {
        self.header_bytes
    }

    /// Data bytes written so far
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Data bytes in acknowledged blocks
    #[must_use]
    pub fn effective_data_bytes(&self) -> u64 {
        self.effective_data_bytes
    }

    /// Header plus data bytes in acknowledged blocks
    #[must_use]
    pub fn effective_total_bytes(&self) -> u64 {
        self.effective_header_bytes + self.effective_data_bytes
    }

    /// Transmitted block count
    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    /// Failed block attempts
    #[must_use]
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }

    /// Reconnect count
    #[must_use]
    pub fn num_reconnects(&self) -> u64 {
        self.num_reconnects
    }

    /// Error observed locally on this thread
    #[must_use]
    pub fn local_error(&self) -> ErrorCode {
        self.local_error
    }

    /// Set the locally observed error
    pub fn set_local_error(&mut self, error: ErrorCode) {
        self.local_error = error;
    }

    /// Error the peer reported for this thread
    #[must_use]
    pub fn remote_error(&self) -> ErrorCode {
        self.remote_error
    }

    /// Set the peer-reported error
    pub fn set_remote_error(&mut self, error: ErrorCode) {
        self.remote_error = error;
    }

    /// Encryption used by this thread's connection
    #[must_use]
    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    /// Record the encryption used by this thread's connection
    pub fn set_encryption_type(&mut self, typ: EncryptionType) {
        self.encryption_type = typ;
    }

    /// Merge counters from `other`; the first non-OK error on either side
    /// sticks
    pub fn combine(&mut self, other: &TransferStats) {
        self.header_bytes += other.header_bytes;
        self.data_bytes += other.data_bytes;
        self.effective_header_bytes += other.effective_header_bytes;
        self.effective_data_bytes += other.effective_data_bytes;
        self.num_blocks += other.num_blocks;
        self.failed_attempts += other.failed_attempts;
        self.num_reconnects += other.num_reconnects;
        if self.local_error.is_ok() {
            self.local_error = other.local_error;
        }
        if self.remote_error.is_ok() {
            self.remote_error = other.remote_error;
        }
    }
}

impl std::fmt::Display for TransferStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "blocks={} effective_bytes={} header_bytes={} failed_attempts={} \
             reconnects={} local={} remote={}",
            self.num_blocks,
            self.effective_data_bytes,
            self.header_bytes,
            self.failed_attempts,
            self.num_reconnects,
            self.local_error,
            self.remote_error,
        )
    }
}

/// Final outcome of a transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Per-thread statistics, indexed by thread
    pub thread_stats: Vec<TransferStats>,
    /// Sources that were never acknowledged
    pub failed_sources: Vec<TransferStats>,
    /// Aggregate of the per-thread stats
    pub summary: TransferStats,
    /// Total payload size the queue discovered
    pub total_file_size: u64,
    /// Blocks the queue discovered
    pub num_blocks_discovered: u64,
    /// Wall-clock duration of the transfer
    pub duration: Duration,
    error_code: ErrorCode,
}

impl TransferReport {
    /// Build a report from per-thread and failed-source stats.
    ///
    /// The aggregate status is OK iff every required source was
    /// acknowledged; otherwise the first meaningful thread error wins.
    #[must_use]
    pub fn new(
        thread_stats: Vec<TransferStats>,
        failed_sources: Vec<TransferStats>,
        total_file_size: u64,
        num_blocks_discovered: u64,
        duration: Duration,
        queue_status: ErrorCode,
    ) -> Self {
        let mut summary = TransferStats::new();
        for stats in &thread_stats {
            summary.combine(stats);
        }
        let error_code = if !queue_status.is_ok() {
            queue_status
        } else if failed_sources.is_empty() {
            ErrorCode::Ok
        } else {
            thread_stats
                .iter()
                .map(TransferStats::local_error)
                .find(|code| !code.is_ok())
                .unwrap_or(ErrorCode::ByteSourceReadError)
        };
        Self {
            thread_stats,
            failed_sources,
            summary,
            total_file_size,
            num_blocks_discovered,
            duration,
            error_code,
        }
    }

    /// Aggregate status of the transfer
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    /// Payload bytes in acknowledged blocks, summed over threads
    #[must_use]
    pub fn effective_data_bytes(&self) -> u64 {
        self.summary.effective_data_bytes()
    }

    /// Reconnects summed over threads
    #[must_use]
    pub fn num_reconnects(&self) -> u64 {
        self.summary.num_reconnects()
    }

    /// Throughput in megabytes per second
    #[must_use]
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.summary.effective_total_bytes() as f64 / secs / (1024.0 * 1024.0)
    }
}

impl std::fmt::Display for TransferReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transfer status {}; {} blocks, {} bytes in {:?} ({:.2} MB/s); {} failed sources",
            self.error_code,
            self.summary.num_blocks(),
            self.summary.effective_data_bytes(),
            self.duration,
            self.throughput_mbps(),
            self.failed_sources.len(),
        )
    }
}

/// Capability receiving periodic report snapshots; pure observer with no
/// effect on the transfer
pub trait ProgressReporter: Send + Sync {
    /// Called with a snapshot at each progress interval
    fn progress(&self, report: &TransferReport);

    /// Called once with the final report
    fn done(&self, report: &TransferReport) {
        self.progress(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_keeps_first_error() {
        let mut a = TransferStats::new();
        a.add_data_bytes(100);
        a.set_local_error(ErrorCode::SocketReadError);

        let mut b = TransferStats::new();
        b.add_data_bytes(50);
        b.set_local_error(ErrorCode::ProtocolError);

        a.combine(&b);
        assert_eq!(a.data_bytes(), 150);
        assert_eq!(a.local_error(), ErrorCode::SocketReadError);
    }

    #[test]
    fn test_report_ok_when_no_failures() {
        let mut stats = TransferStats::new();
        stats.add_effective_bytes(10, 1000);
        stats.incr_num_blocks();
        let report = TransferReport::new(
            vec![stats],
            Vec::new(),
            1000,
            1,
            Duration::from_secs(1),
            ErrorCode::Ok,
        );
        assert_eq!(report.error_code(), ErrorCode::Ok);
        assert_eq!(report.effective_data_bytes(), 1000);
    }

    #[test]
    fn test_report_error_with_failed_sources() {
        let mut stats = TransferStats::new();
        stats.set_local_error(ErrorCode::ProtocolError);
        let report = TransferReport::new(
            vec![stats],
            vec![TransferStats::with_id("lost.bin")],
            1000,
            1,
            Duration::from_secs(1),
            ErrorCode::Ok,
        );
        assert_eq!(report.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_report_failed_thread_but_all_sources_acked() {
        // A thread forced off by a global checkpoint does not fail the
        // transfer when its sources were re-sent elsewhere.
        let mut bad = TransferStats::new();
        bad.set_local_error(ErrorCode::GlobalCheckpointAbort);
        let mut good = TransferStats::new();
        good.add_effective_bytes(10, 500);
        let report = TransferReport::new(
            vec![bad, good],
            Vec::new(),
            500,
            1,
            Duration::from_secs(1),
            ErrorCode::Ok,
        );
        assert_eq!(report.error_code(), ErrorCode::Ok);
    }
}
