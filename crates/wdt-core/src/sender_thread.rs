//! The per-connection sender state machine.
//!
//! Each thread drives one receiver port through a loop over
//! [`SenderState`]: every transition is a value returned by a state
//! function, and the loop is a single `match`. Before each transition the
//! thread consults the abort flag and its history's global-checkpoint flag.

use crate::coordinator::FunnelStatus;
use crate::error::ErrorCode;
use crate::history::CheckpointApply;
use crate::protocol::{self, BlockDetails, Cmd, FooterType, Settings};
use crate::report::TransferStats;
use crate::sender::{NegotiationStatus, SenderShared, ThreadAbortChecker};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wdt_files::{AlignedBuffer, FileByteSource};
use wdt_transport::{AbortChecker, ClientSocket, SocketError};

const VERSION_MISMATCH_BARRIER: &str = "version-mismatch-barrier";
const VERSION_MISMATCH_FUNNEL: &str = "version-mismatch-funnel";

/// States of the per-connection protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Connect,
    ReadLocalCheckpoint,
    SendSettings,
    SendBlocks,
    SendDoneCmd,
    SendSizeCmd,
    CheckForAbort,
    ReadFileChunks,
    ReadReceiverCmd,
    ProcessDoneCmd,
    ProcessWaitCmd,
    ProcessErrCmd,
    ProcessAbortCmd,
    ProcessVersionMismatch,
    End,
}

/// One sender thread: a port, a socket, a buffer and the protocol engine
pub(crate) struct SenderThread {
    shared: Arc<SenderShared>,
    thread_index: usize,
    port: u16,
    /// Thread-local protocol version; re-negotiated on version mismatch
    protocol_version: i32,
    buf: AlignedBuffer,
    socket: Option<ClientSocket>,
    stats: TransferStats,
    total_size_sent: bool,
    num_reconnect_without_progress: u32,
    footer_type: FooterType,
}

impl SenderThread {
    pub(crate) fn new(shared: Arc<SenderShared>, thread_index: usize, port: u16) -> Self {
        let buf = AlignedBuffer::new(shared.options.buffer_size);
        let protocol_version = shared.protocol_version();
        Self {
            shared,
            thread_index,
            port,
            protocol_version,
            buf,
            socket: None,
            stats: TransferStats::new(),
            total_size_sent: false,
            num_reconnect_without_progress: 0,
            footer_type: FooterType::None,
        }
    }

    /// Run the state machine to completion and return the thread's stats
    pub(crate) fn run(mut self) -> TransferStats {
        let start = Instant::now();
        self.set_footer_type();
        let shared = Arc::clone(&self.shared);
        shared
            .coordinator
            .execute_at_start(|| shared.note_transfer_started());

        let mut state = SenderState::Connect;
        while state != SenderState::End {
            let abort_code = self.thread_abort_code();
            if !abort_code.is_ok() {
                error!(port = self.port, code = %abort_code, "transfer aborted");
                if abort_code == ErrorCode::VersionMismatch {
                    self.stats.set_local_error(ErrorCode::Abort);
                    state = SenderState::ProcessVersionMismatch;
                } else {
                    self.stats.set_local_error(abort_code);
                    break;
                }
            }
            state = match state {
                SenderState::Connect => self.connect(),
                SenderState::ReadLocalCheckpoint => self.read_local_checkpoint(),
                SenderState::SendSettings => self.send_settings(),
                SenderState::SendBlocks => self.send_blocks(),
                SenderState::SendDoneCmd => self.send_done_cmd(),
                SenderState::SendSizeCmd => self.send_size_cmd(),
                SenderState::CheckForAbort => self.check_for_abort(),
                SenderState::ReadFileChunks => self.read_file_chunks(),
                SenderState::ReadReceiverCmd => self.read_receiver_cmd(),
                SenderState::ProcessDoneCmd => self.process_done_cmd(),
                SenderState::ProcessWaitCmd => self.process_wait_cmd(),
                SenderState::ProcessErrCmd => self.process_err_cmd(),
                SenderState::ProcessAbortCmd => self.process_abort_cmd(),
                SenderState::ProcessVersionMismatch => self.process_version_mismatch(),
                SenderState::End => SenderState::End,
            };
        }

        self.stats
            .set_encryption_type(self.shared.encryption.get_type());
        info!(
            port = self.port,
            stats = %self.stats,
            elapsed = ?start.elapsed(),
            "sender thread done"
        );
        self.shared.history.mark_not_in_use(i32::from(self.port));
        self.shared.coordinator.deregister_thread();
        let shared = Arc::clone(&self.shared);
        shared
            .coordinator
            .execute_at_end(|| shared.note_transfer_finished());
        // The socket must be released before the thread dies; some socket
        // implementations keep thread-local state.
        self.socket = None;
        self.stats
    }

    fn thread_abort_code(&self) -> ErrorCode {
        self.shared.thread_abort_code(self.port)
    }

    fn socket_mut(&mut self) -> &mut ClientSocket {
        self.socket
            .as_mut()
            .expect("state requires a connected socket")
    }

    fn set_footer_type(&mut self) {
        let encryption_type = self.shared.encryption.get_type();
        let version = self.shared.protocol_version();
        self.footer_type = if version >= protocol::INCREMENTAL_TAG_VERIFICATION_VERSION
            && encryption_type.tag_len() > 0
        {
            FooterType::EncTag
        } else if version >= protocol::CHECKSUM_VERSION && self.shared.options.enable_checksum {
            FooterType::Checksum
        } else {
            FooterType::None
        };
    }

    fn connect(&mut self) -> SenderState {
        debug!(port = self.port, "entered CONNECT state");
        if self.socket.is_some() {
            self.stats.incr_num_reconnects();
            self.socket = None;
        }
        if self.num_reconnect_without_progress >= self.shared.options.max_transfer_retries {
            error!(
                port = self.port,
                reconnects = self.num_reconnect_without_progress,
                "reconnected without making any progress, giving up"
            );
            self.stats.set_local_error(ErrorCode::NoProgress);
            return SenderState::End;
        }

        let abort_checker: Arc<dyn AbortChecker> = Arc::new(ThreadAbortChecker::new(
            Arc::clone(&self.shared),
            self.port,
        ));
        let mut socket = match self.shared.socket_factory.make_socket(
            &self.shared.dest_host,
            self.port,
            &self.shared.options.socket_config(),
            &self.shared.encryption,
            abort_checker,
        ) {
            Ok(socket) => socket,
            Err(err) => {
                error!(%err, "cannot create socket");
                self.stats.set_local_error(ErrorCode::ConnError);
                return SenderState::End;
            }
        };

        let start = Instant::now();
        let max_retries = self.shared.options.max_retries.max(1);
        let mut connected = false;
        let mut attempts = 0;
        for attempt in 1..=max_retries {
            attempts = attempt;
            match socket.connect() {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(err) if !err.is_retryable() => {
                    error!(%err, "fatal connection error");
                    self.stats.set_local_error(ErrorCode::ConnError);
                    return SenderState::End;
                }
                Err(err) => debug!(attempt, %err, "connection attempt failed"),
            }
            let abort_code = self.thread_abort_code();
            if !abort_code.is_ok() {
                self.stats.set_local_error(ErrorCode::Abort);
                if abort_code == ErrorCode::VersionMismatch {
                    return SenderState::ProcessVersionMismatch;
                }
                return SenderState::End;
            }
            if attempt != max_retries {
                std::thread::sleep(Duration::from_millis(self.shared.options.sleep_millis));
            }
        }
        if !connected {
            error!(
                dest = %self.shared.dest_host,
                port = self.port,
                attempts,
                elapsed = ?start.elapsed(),
                "unable to connect"
            );
            self.stats.set_local_error(ErrorCode::ConnError);
            return SenderState::End;
        }
        if attempts > 1 {
            warn!(port = self.port, attempts, elapsed = ?start.elapsed(), "connected");
        } else {
            debug!(port = self.port, elapsed = ?start.elapsed(), "connected");
        }
        self.socket = Some(socket);

        let next = if self.stats.local_error().is_ok() {
            SenderState::SendSettings
        } else {
            // A prior failure means the receiver will open with a local
            // checkpoint for resumption.
            SenderState::ReadLocalCheckpoint
        };
        self.total_size_sent = false;
        self.stats.set_local_error(ErrorCode::Ok);
        next
    }

    fn read_local_checkpoint(&mut self) -> SenderState {
        info!(port = self.port, "entered READ_LOCAL_CHECKPOINT state");
        let mut frame = [0u8; protocol::LOCAL_CHECKPOINT_FRAME_LEN];
        if let Err(err) = self.socket_mut().read_full(&mut frame) {
            error!(port = self.port, %err, "read mismatch during local checkpoint");
            self.stats.set_local_error(ErrorCode::SocketReadError);
            self.num_reconnect_without_progress += 1;
            return SenderState::Connect;
        }
        let checkpoint = match protocol::decode_local_checkpoint(&frame) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(port = self.port, %err, "local checkpoint decode failure");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        };
        if checkpoint.port != i32::from(self.port) {
            error!(port = self.port, %checkpoint, "checkpoint does not match the port");
            self.stats.set_local_error(ErrorCode::ProtocolError);
            return SenderState::End;
        }
        debug!(port = self.port, %checkpoint, "received local checkpoint");
        if checkpoint.num_blocks == -1 {
            // Receiver failed while sending its DONE; its reply is pending.
            return SenderState::ReadReceiverCmd;
        }
        match self
            .shared
            .history
            .set_local_checkpoint(i32::from(self.port), checkpoint)
        {
            CheckpointApply::Invalid => {
                self.stats.set_local_error(ErrorCode::ProtocolError);
                SenderState::End
            }
            CheckpointApply::NoProgress => {
                self.num_reconnect_without_progress += 1;
                SenderState::SendSettings
            }
            CheckpointApply::Progress => {
                self.num_reconnect_without_progress = 0;
                SenderState::SendSettings
            }
        }
    }

    fn send_settings(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_SETTINGS state");
        let send_file_chunks = self.shared.is_send_file_chunks(self.protocol_version);
        let settings = Settings {
            read_timeout_ms: self.shared.options.read_timeout_ms,
            write_timeout_ms: self.shared.options.write_timeout_ms,
            transfer_id: self.shared.transfer_id.clone(),
            enable_checksum: self.footer_type == FooterType::Checksum,
            send_file_chunks,
            block_mode_disabled: self.shared.options.block_size_mbytes <= 0,
        };
        let mut frame = Vec::with_capacity(protocol::MIN_BUF_LENGTH);
        frame.push(Cmd::Settings as u8);
        protocol::encode_settings(&mut frame, &settings);
        if send_file_chunks {
            // Pad so the receiver can issue one uniform initial read.
            frame.resize(protocol::MIN_BUF_LENGTH, 0);
        }
        if let Err(err) = self.socket_mut().write_full(&frame) {
            error!(port = self.port, %err, "settings write failure");
            self.stats.set_local_error(ErrorCode::SocketWriteError);
            return SenderState::Connect;
        }
        self.stats.add_header_bytes(frame.len() as u64);
        if send_file_chunks {
            SenderState::ReadFileChunks
        } else {
            SenderState::SendBlocks
        }
    }

    fn send_blocks(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_BLOCKS state");
        if self.protocol_version >= protocol::RECEIVER_PROGRESS_REPORT_VERSION
            && !self.total_size_sent
            && self.shared.queue.file_discovery_finished()
        {
            return SenderState::SendSizeCmd;
        }
        let (source, queue_status) = self.shared.queue.get_next_source();
        let Some(mut source) = source else {
            return SenderState::SendDoneCmd;
        };
        let block_stats = self.send_one_byte_source(&mut source, ErrorCode::from(queue_status));
        let block_error = block_stats.local_error();
        source.close();
        self.shared.add_data_bytes(block_stats.data_bytes());
        self.stats.combine(&block_stats);
        if !self
            .shared
            .history
            .add_source(i32::from(self.port), source)
        {
            error!(port = self.port, "global checkpoint received, stopping");
            self.stats.set_local_error(ErrorCode::ConnError);
            return SenderState::End;
        }
        if !block_error.is_ok() {
            return SenderState::CheckForAbort;
        }
        SenderState::SendBlocks
    }

    fn send_one_byte_source(
        &mut self,
        source: &mut FileByteSource,
        transfer_status: ErrorCode,
    ) -> TransferStats {
        let mut stats = TransferStats::with_id(source.identifier());
        let expected_size = source.size();
        let full_path = source.metadata().full_path.clone();
        let details = {
            let metadata = source.metadata();
            BlockDetails {
                file_name: metadata.rel_path.clone(),
                seq_id: metadata.seq_id,
                file_size: metadata.size,
                offset: source.offset(),
                data_size: expected_size,
                allocation_status: metadata.allocation_status,
                prev_seq_id: metadata.prev_seq_id,
            }
        };
        let header = protocol::encode_file_header(transfer_status, &details);

        let shared = Arc::clone(&self.shared);
        let port = self.port;
        let footer_type = self.footer_type;
        let throttler = shared.throttler.clone();
        let Some(socket) = self.socket.as_mut() else {
            stats.set_local_error(ErrorCode::ConnError);
            return stats;
        };

        if let Err(err) = socket.write_full(&header) {
            error!(id = %details.file_name, %err, "block header write failure");
            stats.set_local_error(ErrorCode::SocketWriteError);
            stats.incr_failed_attempts();
            return stats;
        }
        stats.add_header_bytes(header.len() as u64);
        let header_bytes = header.len() as u64;
        let mut throttler_pending = header_bytes;
        let mut total_throttled = 0u64;
        let mut checksum = 0u32;
        let mut actual_size = 0u64;

        while !source.finished() {
            let slice = match source.read(&mut self.buf) {
                Ok(Some(slice)) => slice,
                Ok(None) => break,
                Err(err) => {
                    error!(id = %details.file_name, %err, "failed reading source");
                    break;
                }
            };
            if footer_type == FooterType::Checksum {
                checksum = crc32c::crc32c_append(checksum, slice);
            }
            if let Some(throttler) = &throttler {
                // The first call of the block carries the header bytes too;
                // later calls carry only the fresh chunk.
                throttler_pending += slice.len() as u64;
                throttler.limit(throttler_pending);
                total_throttled += throttler_pending;
                throttler_pending = 0;
            }
            match socket.write_full(slice) {
                Ok(()) => {}
                Err(SocketError::Aborted) => {
                    error!(port, id = %details.file_name, "transfer aborted during block");
                    stats.set_local_error(ErrorCode::Abort);
                    stats.incr_failed_attempts();
                    return stats;
                }
                Err(err) => {
                    error!(port, id = %details.file_name, %err, "block write failure");
                    stats.set_local_error(ErrorCode::SocketWriteError);
                    stats.incr_failed_attempts();
                    return stats;
                }
            }
            if !shared.thread_abort_code(port).is_ok() {
                error!(port, id = %details.file_name, "transfer aborted during block");
                stats.set_local_error(ErrorCode::Abort);
                stats.incr_failed_attempts();
                return stats;
            }
            stats.add_data_bytes(slice.len() as u64);
            actual_size += slice.len() as u64;
        }

        if actual_size != expected_size {
            // The file changed or shrank underneath the transfer.
            let observed_size = std::fs::metadata(&full_path).map(|m| m.len()).ok();
            error!(
                id = %details.file_name,
                expected_size,
                actual_size,
                ?observed_size,
                "source ended before the block did"
            );
            stats.set_local_error(ErrorCode::ByteSourceReadError);
            stats.incr_failed_attempts();
            return stats;
        }
        if throttler.is_some() && actual_size > 0 {
            debug_assert_eq!(total_throttled, header_bytes + actual_size);
        }

        if footer_type != FooterType::None {
            let tag = if footer_type == FooterType::EncTag {
                socket.compute_cur_encryption_tag()
            } else {
                Vec::new()
            };
            let footer = protocol::encode_footer(checksum, &tag);
            if let Err(err) = socket.write_full(&footer) {
                error!(id = %details.file_name, %err, "footer write failure");
                stats.set_local_error(ErrorCode::SocketWriteError);
                stats.incr_failed_attempts();
                return stats;
            }
            stats.add_header_bytes(footer.len() as u64);
        }

        stats.set_local_error(ErrorCode::Ok);
        stats.incr_num_blocks();
        stats.add_effective_bytes(stats.header_bytes(), stats.data_bytes());
        stats
    }

    fn send_size_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_SIZE_CMD state");
        let frame = protocol::encode_size_cmd(self.shared.queue.get_total_size());
        if let Err(err) = self.socket_mut().write_full(&frame) {
            error!(port = self.port, %err, "size cmd write failure");
            self.stats.set_local_error(ErrorCode::SocketWriteError);
            return SenderState::CheckForAbort;
        }
        self.stats.add_header_bytes(frame.len() as u64);
        self.total_size_sent = true;
        SenderState::SendBlocks
    }

    fn send_done_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered SEND_DONE_CMD state");
        let (num_blocks, queue_status) = self.shared.queue.get_num_blocks_and_status();
        let frame = protocol::encode_done(
            ErrorCode::from(queue_status),
            num_blocks,
            self.shared.queue.get_total_size(),
        );
        if let Err(err) = self.socket_mut().write_full(&frame) {
            error!(port = self.port, %err, "done cmd write failure");
            self.stats.set_local_error(ErrorCode::SocketWriteError);
            return SenderState::CheckForAbort;
        }
        self.stats.add_header_bytes(frame.len() as u64);
        debug!(port = self.port, "wrote done cmd, waiting for reply");
        SenderState::ReadReceiverCmd
    }

    fn check_for_abort(&mut self) -> SenderState {
        info!(port = self.port, "entered CHECK_FOR_ABORT state");
        match self.socket_mut().read_u8() {
            Ok(byte) if byte == Cmd::Abort as u8 => {
                self.stats.add_header_bytes(1);
                SenderState::ProcessAbortCmd
            }
            Ok(byte) => {
                debug!(port = self.port, byte, "unexpected byte while checking for abort");
                SenderState::Connect
            }
            Err(_) => {
                debug!(port = self.port, "no abort cmd found");
                SenderState::Connect
            }
        }
    }

    fn read_file_chunks(&mut self) -> SenderState {
        info!(port = self.port, "entered READ_FILE_CHUNKS state");
        let byte = match self.socket_mut().read_u8() {
            Ok(byte) => byte,
            Err(err) => {
                error!(port = self.port, %err, "socket read error");
                self.stats.set_local_error(ErrorCode::SocketReadError);
                return SenderState::CheckForAbort;
            }
        };
        self.stats.add_header_bytes(1);
        match Cmd::try_from(byte) {
            Ok(Cmd::Abort) => return SenderState::ProcessAbortCmd,
            Ok(Cmd::Wait) => return SenderState::ReadFileChunks,
            Ok(Cmd::Ack) => {
                if !self.shared.is_file_chunks_received() {
                    error!(
                        port = self.port,
                        "receiver thinks the manifest was already delivered"
                    );
                    self.stats.set_local_error(ErrorCode::ProtocolError);
                    return SenderState::End;
                }
                return SenderState::SendBlocks;
            }
            Ok(Cmd::LocalCheckpoint) => {
                return match self.verify_spurious_checkpoint() {
                    Ok(()) => SenderState::ReadFileChunks,
                    Err(ErrorCode::SocketReadError) => SenderState::Connect,
                    Err(_) => SenderState::End,
                };
            }
            Ok(Cmd::Chunks) => {}
            _ => {
                error!(port = self.port, byte, "unexpected cmd");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        }

        let mut header = [0u8; protocol::CHUNKS_CMD_LEN];
        if let Err(err) = self.socket_mut().read_full(&mut header) {
            error!(port = self.port, %err, "socket read error");
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return SenderState::CheckForAbort;
        }
        self.stats.add_header_bytes(header.len() as u64);
        let Ok((buf_size, num_files)) = protocol::decode_chunks_cmd(&header) else {
            self.stats.set_local_error(ErrorCode::ProtocolError);
            return SenderState::End;
        };
        if !(1..=1 << 30).contains(&buf_size) || num_files < 0 {
            error!(port = self.port, buf_size, num_files, "unusable chunks cmd");
            self.stats.set_local_error(ErrorCode::ProtocolError);
            return SenderState::End;
        }
        info!(
            port = self.port,
            num_files, buf_size, "receiving file chunks manifest"
        );
        let mut chunk_buf = vec![0u8; buf_size as usize];
        let mut chunks = Vec::new();
        while (chunks.len() as i64) < num_files {
            let mut len_buf = [0u8; 4];
            if let Err(err) = self.socket_mut().read_full(&mut len_buf) {
                error!(port = self.port, %err, "socket read error");
                self.stats.set_local_error(ErrorCode::SocketReadError);
                return SenderState::CheckForAbort;
            }
            let batch_len = i32::from_le_bytes(len_buf);
            if batch_len <= 0 || i64::from(batch_len) > buf_size {
                error!(port = self.port, batch_len, "bad chunk batch length");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
            if let Err(err) = self
                .socket_mut()
                .read_full(&mut chunk_buf[..batch_len as usize])
            {
                error!(port = self.port, %err, "socket read error");
                self.stats.set_local_error(ErrorCode::SocketReadError);
                return SenderState::CheckForAbort;
            }
            self.stats.add_header_bytes(4 + batch_len as u64);
            if let Err(err) = protocol::decode_file_chunks_info_list(
                &chunk_buf[..batch_len as usize],
                &mut chunks,
            ) {
                error!(port = self.port, %err, "unable to decode file chunks list");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
            if chunks.len() as i64 > num_files {
                error!(
                    port = self.port,
                    received = chunks.len(),
                    advertised = num_files,
                    "more file chunks than advertised"
                );
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        }
        self.shared.set_file_chunks_info(chunks);
        if let Err(err) = self.socket_mut().write_full(&[Cmd::Ack as u8]) {
            error!(port = self.port, %err, "manifest ack write failure");
            self.stats.set_local_error(ErrorCode::SocketWriteError);
            return SenderState::CheckForAbort;
        }
        self.stats.add_header_bytes(1);
        SenderState::SendBlocks
    }

    /// Read the next receiver command with buffered-send awareness: a
    /// timeout is not fatal while the kernel send buffer is still
    /// draining, and once drained the receiver gets a symmetric grace
    /// period to drain its own.
    fn read_next_receiver_cmd(&mut self) -> Result<u8, ErrorCode> {
        let shared = Arc::clone(&self.shared);
        let port = self.port;
        let drain_extra = Duration::from_millis(shared.options.drain_extra_ms);
        let socket = self.socket_mut();
        let mut num_unacked = socket.unacked_send_bytes();
        let start = Instant::now();
        let time_to_drain;
        loop {
            match socket.read_u8() {
                Ok(byte) => return Ok(byte),
                Err(SocketError::Aborted) => return Err(ErrorCode::Abort),
                Err(SocketError::UnexpectedEof) => {
                    warn!(port, "unexpected EOF, reconnecting");
                    return Err(ErrorCode::SocketReadError);
                }
                Err(SocketError::Timeout) => {
                    if !shared.thread_abort_code(port).is_ok() {
                        return Err(ErrorCode::Abort);
                    }
                    let cur_unacked = socket.unacked_send_bytes();
                    match (num_unacked, cur_unacked) {
                        (Some(prev), Some(cur)) => {
                            if cur == 0 {
                                time_to_drain = start.elapsed();
                                break;
                            }
                            if cur >= prev {
                                error!(port, unacked = cur, "send buffer is not draining");
                                return Err(ErrorCode::SocketReadError);
                            }
                            info!(port, prev, cur, "send buffer draining, retrying read");
                            num_unacked = cur_unacked;
                        }
                        _ => {
                            error!(port, "failed to read unacked byte count");
                            return Err(ErrorCode::SocketReadError);
                        }
                    }
                }
                Err(err) => {
                    error!(port, %err, "failed to read receiver cmd");
                    return Err(ErrorCode::SocketReadError);
                }
            }
        }
        // Assume symmetric buffer sizes: give the receiver as long to drain
        // its own queue as ours took, plus slack.
        let read_timeout = time_to_drain + drain_extra;
        info!(port, ?time_to_drain, ?read_timeout, "send buffer cleared, waiting");
        match socket.read_u8_with_timeout(read_timeout) {
            Ok(byte) => Ok(byte),
            Err(SocketError::Aborted) => Err(ErrorCode::Abort),
            Err(err) => {
                error!(port, %err, "failed to read receiver cmd");
                Err(ErrorCode::SocketReadError)
            }
        }
    }

    fn read_receiver_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered READ_RECEIVER_CMD state");
        let byte = match self.read_next_receiver_cmd() {
            Ok(byte) => byte,
            Err(code) => {
                self.stats.set_local_error(code);
                return SenderState::Connect;
            }
        };
        match Cmd::try_from(byte) {
            Ok(Cmd::Err) => SenderState::ProcessErrCmd,
            Ok(Cmd::Wait) => SenderState::ProcessWaitCmd,
            Ok(Cmd::Done) => SenderState::ProcessDoneCmd,
            Ok(Cmd::Abort) => SenderState::ProcessAbortCmd,
            Ok(Cmd::LocalCheckpoint) => match self.verify_spurious_checkpoint() {
                Ok(()) => SenderState::ReadReceiverCmd,
                Err(ErrorCode::SocketReadError) => SenderState::Connect,
                Err(_) => SenderState::End,
            },
            _ => {
                error!(port = self.port, byte, "read unexpected receiver cmd");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                SenderState::End
            }
        }
    }

    /// A LOCAL_CHECKPOINT where another command belongs is tolerated only
    /// when it is spurious: one all-zero checkpoint for this port.
    fn verify_spurious_checkpoint(&mut self) -> Result<(), ErrorCode> {
        let mut frame = [0u8; protocol::LOCAL_CHECKPOINT_FRAME_LEN];
        frame[0] = Cmd::LocalCheckpoint as u8;
        if let Err(err) = self.socket_mut().read_full(&mut frame[1..]) {
            error!(port = self.port, %err, "cannot read candidate local checkpoint");
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return Err(ErrorCode::SocketReadError);
        }
        match protocol::decode_local_checkpoint(&frame) {
            Ok(checkpoint)
                if checkpoint.port == i32::from(self.port)
                    && checkpoint.num_blocks == 0
                    && checkpoint.last_block_received_bytes == 0 =>
            {
                warn!(port = self.port, "ignoring valid but spurious local checkpoint");
                Ok(())
            }
            _ => {
                error!(port = self.port, "failed to verify spurious local checkpoint");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                Err(ErrorCode::ProtocolError)
            }
        }
    }

    fn process_done_cmd(&mut self) -> SenderState {
        debug!(port = self.port, "entered PROCESS_DONE_CMD state");
        // DONE implies every block sent so far is acknowledged.
        self.shared.history.mark_all_acknowledged(i32::from(self.port));
        let port = self.port;
        let socket = self.socket_mut();
        if let Err(err) = socket.write_full(&[Cmd::Done as u8]) {
            warn!(port = port, %err, "cannot ack DONE");
        }
        if let Err(err) = socket.shutdown_writes() {
            warn!(port = self.port, %err, "shutdown failed");
        }
        match self.socket_mut().expect_end_of_stream() {
            Ok(()) => {
                debug!(port = self.port, "done with transfer");
                SenderState::End
            }
            Err(err) => {
                warn!(port = self.port, %err, "logical EOF not found when expected");
                self.stats.set_local_error(ErrorCode::SocketReadError);
                SenderState::Connect
            }
        }
    }

    fn process_wait_cmd(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_WAIT_CMD state");
        // WAIT verifies all blocks, like DONE.
        self.shared.history.mark_all_acknowledged(i32::from(self.port));
        SenderState::ReadReceiverCmd
    }

    fn process_err_cmd(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_ERR_CMD state");
        // A global checkpoint command verifies all blocks, like DONE.
        self.shared.history.mark_all_acknowledged(i32::from(self.port));
        let mut len_buf = [0u8; 2];
        if let Err(err) = self.socket_mut().read_full(&mut len_buf) {
            error!(port = self.port, %err, "socket read error");
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return SenderState::Connect;
        }
        let checkpoints_len = usize::from(u16::from_le_bytes(len_buf));
        let mut checkpoint_buf = vec![0u8; checkpoints_len];
        if let Err(err) = self.socket_mut().read_full(&mut checkpoint_buf) {
            error!(port = self.port, %err, "socket read error");
            self.stats.set_local_error(ErrorCode::SocketReadError);
            return SenderState::Connect;
        }
        let mut decoder = protocol::Decoder::new(&checkpoint_buf);
        let checkpoints = match protocol::decode_checkpoint_list(&mut decoder) {
            Ok(checkpoints) => checkpoints,
            Err(err) => {
                error!(port = self.port, %err, "checkpoint decode failure");
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        };
        for checkpoint in checkpoints {
            info!(port = self.port, %checkpoint, "received global checkpoint");
            if self.shared.history.handle_global_checkpoint(checkpoint).is_err() {
                self.stats.set_local_error(ErrorCode::ProtocolError);
                return SenderState::End;
            }
        }
        SenderState::SendBlocks
    }

    fn process_abort_cmd(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_ABORT_CMD state");
        self.stats.set_local_error(ErrorCode::Abort);
        let mut frame = [0u8; protocol::ABORT_FRAME_LEN];
        if let Err(err) = self.socket_mut().read_full(&mut frame) {
            // Still must exit because of the abort.
            error!(port = self.port, %err, "error while reading abort cmd");
            return SenderState::End;
        }
        let (negotiated_protocol, remote_error, checkpoint) = match protocol::decode_abort(&frame)
        {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(port = self.port, %err, "abort decode failure");
                return SenderState::End;
            }
        };
        self.stats.set_remote_error(remote_error);
        let failed_file = self
            .shared
            .history
            .source_id(i32::from(self.port), checkpoint);
        warn!(
            port = self.port,
            negotiated_protocol,
            remote_error = %remote_error,
            failed_file,
            checkpoint,
            "received abort"
        );
        self.shared.abort(remote_error);
        if remote_error == ErrorCode::VersionMismatch {
            if negotiated_protocol > 0
                && protocol::negotiate_protocol(negotiated_protocol, self.protocol_version)
                    == negotiated_protocol
            {
                self.shared
                    .record_negotiated_protocol(self.thread_index, negotiated_protocol);
                return SenderState::ProcessVersionMismatch;
            }
            error!(
                port = self.port,
                negotiated_protocol, "cannot support receiver version"
            );
            self.stats.set_remote_error(ErrorCode::VersionIncompatible);
        }
        SenderState::End
    }

    fn process_version_mismatch(&mut self) -> SenderState {
        info!(port = self.port, "entered PROCESS_VERSION_MISMATCH state");
        debug_assert_eq!(self.stats.local_error(), ErrorCode::Abort);
        match self.shared.negotiation_status() {
            NegotiationStatus::Failed => {
                // Threads end on failure before re-entering this state.
                error!(port = self.port, "negotiation already failed");
                return SenderState::End;
            }
            NegotiationStatus::Resolved => {
                warn!(
                    port = self.port,
                    "version already negotiated, but transfer still aborted"
                );
                return SenderState::End;
            }
            NegotiationStatus::Wait => {}
        }
        // Every thread must have recorded its negotiated protocol before
        // anyone reads the consensus.
        self.shared.coordinator.barrier_execute(VERSION_MISMATCH_BARRIER);
        debug!(port = self.port, "cleared the protocol version barrier");
        loop {
            match self.shared.coordinator.funnel_status(VERSION_MISMATCH_FUNNEL) {
                FunnelStatus::Start => {
                    info!(port = self.port, "started the funnel for version mismatch");
                    self.shared.set_negotiation_status(NegotiationStatus::Failed);
                    if let Err(code) = self.shared.history.handle_version_mismatch() {
                        error!(port = self.port, %code, "history rollback failed");
                        self.shared.coordinator.funnel_notify_success(VERSION_MISMATCH_FUNNEL);
                        return SenderState::End;
                    }
                    let mut negotiated = 0i32;
                    for version in self.shared.negotiated_protocols() {
                        if version <= 0 {
                            continue;
                        }
                        if negotiated > 0 && negotiated != version {
                            error!(
                                negotiated,
                                version, "threads negotiated different protocols"
                            );
                            self.shared.coordinator.funnel_notify_success(VERSION_MISMATCH_FUNNEL);
                            return SenderState::End;
                        }
                        negotiated = version;
                    }
                    if negotiated <= 0 {
                        error!(port = self.port, "no negotiated protocol recorded");
                        self.shared.coordinator.funnel_notify_success(VERSION_MISMATCH_FUNNEL);
                        return SenderState::End;
                    }
                    if negotiated != self.protocol_version {
                        info!(
                            port = self.port,
                            from = self.protocol_version,
                            to = negotiated,
                            "changing protocol version"
                        );
                    }
                    self.shared.set_protocol_version(negotiated);
                    self.protocol_version = negotiated;
                    self.set_footer_type();
                    self.stats.set_remote_error(ErrorCode::Ok);
                    self.shared.set_negotiation_status(NegotiationStatus::Resolved);
                    self.shared.clear_abort();
                    self.shared.coordinator.funnel_notify_success(VERSION_MISMATCH_FUNNEL);
                    return SenderState::Connect;
                }
                FunnelStatus::Progress => {
                    self.shared.coordinator.funnel_wait(VERSION_MISMATCH_FUNNEL);
                }
                FunnelStatus::End => {
                    return match self.shared.negotiation_status() {
                        NegotiationStatus::Failed => SenderState::End,
                        NegotiationStatus::Resolved => {
                            self.protocol_version = self.shared.protocol_version();
                            self.stats.set_remote_error(ErrorCode::Ok);
                            SenderState::Connect
                        }
                        NegotiationStatus::Wait => {
                            error!(port = self.port, "negotiation unresolved after funnel");
                            SenderState::End
                        }
                    };
                }
            }
        }
    }
}
