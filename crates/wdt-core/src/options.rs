//! Tunables for the sender engine.

use wdt_transport::SocketConfig;

/// Operational knobs for the sender.
///
/// The defaults mirror the values the engine has been operated with; tests
/// shrink the timeouts.
#[derive(Debug, Clone)]
pub struct WdtOptions {
    /// Socket read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Socket write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Per-attempt connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How often blocked operations poll the abort flag, in milliseconds
    pub abort_check_interval_ms: u64,
    /// Connection attempts per CONNECT state entry
    pub max_retries: u32,
    /// Sleep between connection attempts in milliseconds
    pub sleep_millis: u64,
    /// Reconnects without progress before a thread gives up
    pub max_transfer_retries: u32,
    /// Extra wait after the send buffer drains, for the receiver to drain
    /// its own, in milliseconds
    pub drain_extra_ms: u64,
    /// Per-thread read buffer size in bytes
    pub buffer_size: usize,
    /// Block size in mebibytes; 0 or negative disables block mode
    pub block_size_mbytes: i64,
    /// Append a CRC-32C checksum footer to each block when no
    /// authenticated cipher provides a tag
    pub enable_checksum: bool,
    /// Kernel send buffer size; 0 keeps the system default
    pub send_buffer_size: usize,
    /// Interval between progress reports in milliseconds; 0 disables the
    /// progress thread
    pub progress_report_interval_ms: u64,
    /// Follow symlinks during directory discovery
    pub follow_symlinks: bool,
    /// Read source files with direct I/O
    pub direct_reads: bool,
    /// Ask the receiver for its chunk manifest and skip present ranges
    pub enable_download_resumption: bool,
}

impl Default for WdtOptions {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            connect_timeout_ms: 2000,
            abort_check_interval_ms: 200,
            max_retries: 20,
            sleep_millis: 50,
            max_transfer_retries: 3,
            drain_extra_ms: 500,
            buffer_size: 256 * 1024,
            block_size_mbytes: 16,
            enable_checksum: true,
            send_buffer_size: 0,
            progress_report_interval_ms: 0,
            follow_symlinks: false,
            direct_reads: false,
            enable_download_resumption: false,
        }
    }
}

impl WdtOptions {
    /// Block size in bytes; 0 when block mode is disabled
    #[must_use]
    pub fn block_size_bytes(&self) -> u64 {
        if self.block_size_mbytes <= 0 {
            0
        } else {
            self.block_size_mbytes as u64 * 1024 * 1024
        }
    }

    /// Socket configuration derived from these options
    #[must_use]
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
            abort_check_interval_ms: self.abort_check_interval_ms,
            send_buffer_size: self.send_buffer_size,
        }
    }
}
