//! The sender: owns the queue, the history controller, the abort flag and
//! one thread per receiver port.

use crate::coordinator::ThreadCoordinator;
use crate::error::ErrorCode;
use crate::history::TransferHistoryController;
use crate::options::WdtOptions;
use crate::protocol;
use crate::report::{ProgressReporter, TransferReport, TransferStats};
use crate::request::{RequestError, WdtTransferRequest};
use crate::sender_thread::SenderThread;
use crate::throttler::Throttler;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wdt_files::{DirectorySourceQueue, FileChunksInfo, QueueConfig};
use wdt_transport::{
    AbortChecker, DefaultSocketFactory, EncryptionParams, SocketFactory,
};

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TransferStatus {
    /// Threads have not been spawned yet
    NotStarted = 0,
    /// Threads are running
    Ongoing = 1,
    /// All threads finished
    Finished = 2,
}

/// Process-wide protocol-negotiation state, transitioned exactly once by
/// the last thread through the version-mismatch funnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStatus {
    /// Waiting for the version mismatch to be processed
    Wait,
    /// Version mismatch processed successfully
    Resolved,
    /// Version mismatch processing failed
    Failed,
}

/// State shared between the sender and its threads. Threads hold a
/// read-mostly handle; the sender keeps the owning one.
pub(crate) struct SenderShared {
    pub(crate) options: WdtOptions,
    pub(crate) dest_host: String,
    pub(crate) transfer_id: String,
    pub(crate) encryption: EncryptionParams,
    pub(crate) queue: Arc<DirectorySourceQueue>,
    pub(crate) history: Arc<TransferHistoryController>,
    pub(crate) coordinator: Arc<ThreadCoordinator>,
    pub(crate) socket_factory: Arc<dyn SocketFactory>,
    pub(crate) throttler: Option<Arc<dyn Throttler>>,
    resumption_enabled: bool,
    abort_code: AtomicI32,
    protocol_version: AtomicI32,
    negotiation: Mutex<NegotiationStatus>,
    negotiated_protocols: Mutex<Vec<i32>>,
    file_chunks_received: AtomicBool,
    status: Arc<AtomicI32>,
    data_bytes_sent: AtomicU64,
}

impl SenderShared {
    /// Global abort code; OK means keep going
    pub(crate) fn cur_abort_code(&self) -> ErrorCode {
        ErrorCode::try_from(self.abort_code.load(Ordering::Acquire))
            .unwrap_or(ErrorCode::Abort)
    }

    /// Abort code a specific thread must honour; includes the thread's
    /// global-checkpoint eviction
    pub(crate) fn thread_abort_code(&self, port: u16) -> ErrorCode {
        let code = self.cur_abort_code();
        if !code.is_ok() {
            return code;
        }
        if self.history.is_global_checkpoint_received(i32::from(port)) {
            return ErrorCode::GlobalCheckpointAbort;
        }
        ErrorCode::Ok
    }

    pub(crate) fn abort(&self, code: ErrorCode) {
        warn!(code = %code, "abort requested");
        self.abort_code.store(code as i32, Ordering::Release);
    }

    /// Only legal during version-mismatch recovery
    pub(crate) fn clear_abort(&self) {
        self.abort_code.store(ErrorCode::Ok as i32, Ordering::Release);
    }

    pub(crate) fn protocol_version(&self) -> i32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub(crate) fn set_protocol_version(&self, version: i32) {
        self.protocol_version.store(version, Ordering::Release);
    }

    pub(crate) fn negotiation_status(&self) -> NegotiationStatus {
        *self.negotiation.lock().unwrap()
    }

    pub(crate) fn set_negotiation_status(&self, status: NegotiationStatus) {
        *self.negotiation.lock().unwrap() = status;
    }

    pub(crate) fn record_negotiated_protocol(&self, thread_index: usize, version: i32) {
        self.negotiated_protocols.lock().unwrap()[thread_index] = version;
    }

    pub(crate) fn negotiated_protocols(&self) -> Vec<i32> {
        self.negotiated_protocols.lock().unwrap().clone()
    }

    /// Whether SETTINGS should ask for the resumption manifest
    pub(crate) fn is_send_file_chunks(&self, thread_protocol_version: i32) -> bool {
        self.resumption_enabled
            && thread_protocol_version >= protocol::DOWNLOAD_RESUMPTION_VERSION
    }

    pub(crate) fn is_file_chunks_received(&self) -> bool {
        self.file_chunks_received.load(Ordering::Acquire)
    }

    /// Hand the receiver's manifest to the queue; first delivery wins
    pub(crate) fn set_file_chunks_info(&self, chunks: Vec<FileChunksInfo>) {
        self.queue.set_file_chunks_info(chunks);
        self.file_chunks_received.store(true, Ordering::Release);
    }

    pub(crate) fn transfer_status(&self) -> TransferStatus {
        match self.status.load(Ordering::Acquire) {
            0 => TransferStatus::NotStarted,
            1 => TransferStatus::Ongoing,
            _ => TransferStatus::Finished,
        }
    }

    fn set_transfer_status(&self, status: TransferStatus) {
        self.status.store(status as i32, Ordering::Release);
    }

    pub(crate) fn note_transfer_started(&self) {
        debug!("first sender thread running");
        self.set_transfer_status(TransferStatus::Ongoing);
    }

    pub(crate) fn note_transfer_finished(&self) {
        debug!("last sender thread done");
        self.set_transfer_status(TransferStatus::Finished);
    }

    pub(crate) fn add_data_bytes(&self, bytes: u64) {
        self.data_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    fn data_bytes_sent(&self) -> u64 {
        self.data_bytes_sent.load(Ordering::Relaxed)
    }
}

/// Abort capability handed to sockets and the queue; true once the owning
/// thread has any reason to stop
pub(crate) struct ThreadAbortChecker {
    shared: Arc<SenderShared>,
    port: u16,
}

impl ThreadAbortChecker {
    pub(crate) fn new(shared: Arc<SenderShared>, port: u16) -> Self {
        Self { shared, port }
    }
}

impl AbortChecker for ThreadAbortChecker {
    fn should_abort(&self) -> bool {
        !self.shared.thread_abort_code(self.port).is_ok()
    }
}

/// Multi-connection sender for one transfer.
///
/// One instance drives one transfer: `transfer_async` spawns the discovery
/// thread and one sender thread per port, `finish` joins everything and
/// yields the report. The destructor aborts a still-running transfer.
pub struct Sender {
    shared: Arc<SenderShared>,
    ports: Vec<u16>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    threads: Vec<JoinHandle<TransferStats>>,
    dir_thread: Option<JoinHandle<()>>,
    progress_thread: Option<JoinHandle<()>>,
    progress_stop: Arc<(Mutex<bool>, Condvar)>,
    started: bool,
    start_time: Instant,
    report: Option<TransferReport>,
}

impl Sender {
    /// Build a sender for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the request is unusable (no ports,
    /// oversized transfer id, unsupported protocol version).
    pub fn new(request: &WdtTransferRequest, options: WdtOptions) -> Result<Self, RequestError> {
        if request.ports.is_empty() {
            return Err(RequestError::NoPorts);
        }
        if request.transfer_id.len() > protocol::MAX_TRANSFER_ID_LENGTH {
            return Err(RequestError::TransferIdTooLong);
        }
        if request.protocol_version < protocol::MIN_PROTOCOL_VERSION
            || request.protocol_version > protocol::PROTOCOL_VERSION
        {
            return Err(RequestError::InvalidProtocol(
                request.protocol_version.to_string(),
            ));
        }

        let status = Arc::new(AtomicI32::new(TransferStatus::NotStarted as i32));
        let queue_status = Arc::clone(&status);
        let explicit_files = if request.disable_directory_traversal
            || !request.file_info.is_empty()
        {
            Some(request.file_info.clone())
        } else {
            None
        };
        let queue_config = QueueConfig {
            follow_symlinks: options.follow_symlinks,
            block_size: options.block_size_bytes(),
            direct_reads: options.direct_reads,
            explicit_files,
            expect_manifest: options.enable_download_resumption,
        };
        let queue = Arc::new(DirectorySourceQueue::new(
            request.directory.clone(),
            queue_config,
            Box::new(move || queue_status.load(Ordering::Acquire) == TransferStatus::Finished as i32),
        ));
        let history = Arc::new(TransferHistoryController::new(&queue, &request.ports));
        let coordinator = Arc::new(ThreadCoordinator::new(request.ports.len()));
        let num_ports = request.ports.len();
        let options_resumption = options.enable_download_resumption;

        let shared = Arc::new(SenderShared {
            options,
            dest_host: request.host.clone(),
            transfer_id: request.transfer_id.clone(),
            encryption: request.encryption.clone(),
            queue,
            history,
            coordinator,
            socket_factory: Arc::new(DefaultSocketFactory::default()),
            throttler: None,
            resumption_enabled: options_resumption,
            abort_code: AtomicI32::new(ErrorCode::Ok as i32),
            protocol_version: AtomicI32::new(request.protocol_version),
            negotiation: Mutex::new(NegotiationStatus::Wait),
            negotiated_protocols: Mutex::new(vec![0; num_ports]),
            file_chunks_received: AtomicBool::new(false),
            status,
            data_bytes_sent: AtomicU64::new(0),
        });

        Ok(Self {
            shared,
            ports: request.ports.clone(),
            progress_reporter: None,
            threads: Vec::new(),
            dir_thread: None,
            progress_thread: None,
            progress_stop: Arc::new((Mutex::new(false), Condvar::new())),
            started: false,
            start_time: Instant::now(),
            report: None,
        })
    }

    fn shared_mut(&mut self) -> Option<&mut SenderShared> {
        if self.started {
            warn!("ignoring configuration change after start");
            return None;
        }
        Arc::get_mut(&mut self.shared)
    }

    /// Install a throttler; must happen before the transfer starts
    pub fn set_throttler(&mut self, throttler: Arc<dyn Throttler>) {
        if let Some(shared) = self.shared_mut() {
            shared.throttler = Some(throttler);
        }
    }

    /// Install a socket factory; must happen before the transfer starts
    pub fn set_socket_factory(&mut self, factory: Arc<dyn SocketFactory>) {
        if let Some(shared) = self.shared_mut() {
            shared.socket_factory = factory;
        }
    }

    /// Install a progress reporter; must happen before the transfer starts
    pub fn set_progress_reporter(&mut self, reporter: Arc<dyn ProgressReporter>) {
        if self.started {
            warn!("ignoring configuration change after start");
            return;
        }
        self.progress_reporter = Some(reporter);
    }

    /// Spawn the discovery thread and one sender thread per port, then
    /// return. Call [`finish`](Self::finish) to join and collect the
    /// report.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::MemoryAllocationError`] when a thread cannot
    /// be spawned.
    pub fn transfer_async(&mut self) -> Result<(), ErrorCode> {
        if self.started {
            warn!("transfer already started");
            return Ok(());
        }
        self.started = true;
        self.start_time = Instant::now();
        info!(request = %self.log_safe_string(), "starting transfer");

        let queue = Arc::clone(&self.shared.queue);
        let dir_thread = std::thread::Builder::new()
            .name("wdt-discovery".into())
            .spawn(move || queue.discover())
            .map_err(|err| {
                error!(%err, "cannot spawn discovery thread");
                ErrorCode::MemoryAllocationError
            })?;
        self.dir_thread = Some(dir_thread);

        for (thread_index, &port) in self.ports.iter().enumerate() {
            let thread = SenderThread::new(Arc::clone(&self.shared), thread_index, port);
            let handle = std::thread::Builder::new()
                .name(format!("wdt-sender-{port}"))
                .spawn(move || thread.run())
                .map_err(|err| {
                    error!(%err, "cannot spawn sender thread");
                    self.shared.abort(ErrorCode::Abort);
                    ErrorCode::MemoryAllocationError
                })?;
            self.threads.push(handle);
        }

        let interval = self.shared.options.progress_report_interval_ms;
        if interval > 0 {
            if let Some(reporter) = self.progress_reporter.clone() {
                let shared = Arc::clone(&self.shared);
                let stop = Arc::clone(&self.progress_stop);
                let start_time = self.start_time;
                let handle = std::thread::Builder::new()
                    .name("wdt-progress".into())
                    .spawn(move || {
                        let (lock, cond) = &*stop;
                        let mut stopped = lock.lock().unwrap();
                        loop {
                            let (guard, _) = cond
                                .wait_timeout(stopped, Duration::from_millis(interval))
                                .unwrap();
                            stopped = guard;
                            if *stopped {
                                break;
                            }
                            reporter.progress(&snapshot_report(&shared, start_time));
                        }
                    })
                    .map_err(|err| {
                        error!(%err, "cannot spawn progress thread");
                        ErrorCode::MemoryAllocationError
                    })?;
                self.progress_thread = Some(handle);
            }
        }
        Ok(())
    }

    /// Join all threads and produce the final report. Idempotent and
    /// thread-safe with respect to repeated calls: later calls return the
    /// same report without joining twice.
    pub fn finish(&mut self) -> TransferReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let thread_stats: Vec<TransferStats> = self
            .threads
            .drain(..)
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    error!("sender thread panicked");
                    let mut stats = TransferStats::new();
                    stats.set_local_error(ErrorCode::Abort);
                    stats
                })
            })
            .collect();
        // Finished stops discovery through the queue's abort hook.
        self.shared.note_transfer_finished();
        {
            let (lock, cond) = &*self.progress_stop;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        if let Some(handle) = self.progress_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dir_thread.take() {
            let _ = handle.join();
        }

        let mut failed_sources = self.shared.history.drain_failed_sources();
        for (id, _size) in self.shared.queue.drain_failed_sources() {
            let mut stats = TransferStats::with_id(id);
            stats.set_local_error(ErrorCode::ByteSourceReadError);
            stats.incr_failed_attempts();
            failed_sources.push(stats);
        }
        for (id, _size) in self.shared.queue.drain_remaining() {
            failed_sources.push(TransferStats::with_id(id));
        }

        let (num_blocks, queue_status) = self.shared.queue.get_num_blocks_and_status();
        let report = TransferReport::new(
            thread_stats,
            failed_sources,
            self.shared.queue.get_total_size(),
            num_blocks,
            self.start_time.elapsed(),
            ErrorCode::from(queue_status),
        );
        let acknowledged = self.shared.history.num_acknowledged_total() as u64;
        if report.error_code().is_ok() && acknowledged != num_blocks {
            debug!(
                acknowledged,
                num_blocks, "acknowledged block count differs from discovery count"
            );
        }
        if let Some(reporter) = &self.progress_reporter {
            reporter.done(&report);
        }
        info!(report = %report, "transfer finished");
        self.report = Some(report.clone());
        report
    }

    /// Run the whole transfer synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode`] when the transfer cannot start.
    pub fn transfer(&mut self) -> Result<TransferReport, ErrorCode> {
        self.transfer_async()?;
        Ok(self.finish())
    }

    /// Set the global abort code; every thread observes it at its next
    /// state boundary or blocking operation
    pub fn abort(&self, code: ErrorCode) {
        self.shared.abort(code);
    }

    /// Current lifecycle status
    #[must_use]
    pub fn transfer_status(&self) -> TransferStatus {
        self.shared.transfer_status()
    }

    /// Loggable description of the transfer
    #[must_use]
    pub fn log_safe_string(&self) -> String {
        format!(
            "wdt://{}?ports={}&enc={}",
            self.shared.dest_host,
            self.ports
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            self.shared.encryption.log_safe_string(),
        )
    }
}

fn snapshot_report(shared: &SenderShared, start_time: Instant) -> TransferReport {
    let mut stats = TransferStats::new();
    stats.add_data_bytes(shared.data_bytes_sent());
    let (num_blocks, queue_status) = shared.queue.get_num_blocks_and_status();
    TransferReport::new(
        vec![stats],
        Vec::new(),
        shared.queue.get_total_size(),
        num_blocks,
        start_time.elapsed(),
        ErrorCode::from(queue_status),
    )
}

impl Drop for Sender {
    fn drop(&mut self) {
        if self.started && self.report.is_none() {
            self.abort(ErrorCode::Abort);
            self.finish();
        }
    }
}
