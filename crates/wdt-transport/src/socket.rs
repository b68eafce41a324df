//! Abort-aware blocking TCP client socket.
//!
//! All reads and writes run in short timeout slices so a pending abort is
//! observed within one abort-check interval even while blocked. Full-read
//! and full-write semantics match what the protocol needs: an operation
//! either completes, times out, or fails; partial progress is never
//! surfaced to the caller.

use crate::encryption::{CipherError, CipherProvider, EncryptionParams, PlainTextProvider, StreamCipher};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Capability polled before and during blocking I/O
pub trait AbortChecker: Send + Sync {
    /// Whether the owning transfer wants out
    fn should_abort(&self) -> bool;
}

/// Abort checker that never fires
#[derive(Debug, Default)]
pub struct NeverAbort;

impl AbortChecker for NeverAbort {
    fn should_abort(&self) -> bool {
        false
    }
}

/// Socket-level errors
#[derive(Debug, Error)]
pub enum SocketError {
    /// The operation did not complete within its timeout
    #[error("socket operation timed out")]
    Timeout,

    /// The peer closed the connection mid-operation
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Data arrived where the logical end of stream was expected
    #[error("unexpected data at end of stream")]
    UnexpectedData,

    /// The abort checker fired during the operation
    #[error("aborted")]
    Aborted,

    /// The socket is not connected
    #[error("socket not connected")]
    NotConnected,

    /// Any other I/O failure
    #[error("socket i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Connection-establishment errors, split by retryability
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Name resolution failed; retrying will not help
    #[error("cannot resolve {dest}:{port}: {source}")]
    Resolve {
        /// Destination host
        dest: String,
        /// Destination port
        port: u16,
        /// Underlying error
        source: io::Error,
    },

    /// The TCP connection could not be established
    #[error("cannot connect to {dest}:{port}: {source}")]
    Connect {
        /// Destination host
        dest: String,
        /// Destination port
        port: u16,
        /// Underlying error
        source: io::Error,
    },
}

impl ConnectError {
    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Timeouts and buffer sizing for client sockets
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Per-attempt connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds; resets whenever bytes arrive
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds; resets whenever bytes drain
    pub write_timeout_ms: u64,
    /// How often blocked I/O polls the abort checker, in milliseconds
    pub abort_check_interval_ms: u64,
    /// Kernel send buffer size; 0 keeps the system default
    pub send_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            abort_check_interval_ms: 200,
            send_buffer_size: 0,
        }
    }
}

impl SocketConfig {
    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn abort_interval(&self) -> Duration {
        Duration::from_millis(self.abort_check_interval_ms.max(1))
    }
}

/// Blocking TCP connection to one receiver port.
///
/// Owned exclusively by one sender thread. All traffic runs through the
/// connection's [`StreamCipher`]; clear-text transfers use the pass-through
/// cipher, so the I/O path is uniform.
pub struct ClientSocket {
    dest: String,
    port: u16,
    config: SocketConfig,
    abort: Arc<dyn AbortChecker>,
    cipher: Box<dyn StreamCipher>,
    encrypted: bool,
    stream: Option<TcpStream>,
    scratch: Vec<u8>,
}

impl ClientSocket {
    /// Create an unconnected socket
    #[must_use]
    pub fn new(
        dest: impl Into<String>,
        port: u16,
        config: SocketConfig,
        params: &EncryptionParams,
        cipher: Box<dyn StreamCipher>,
        abort: Arc<dyn AbortChecker>,
    ) -> Self {
        Self {
            dest: dest.into(),
            port,
            config,
            abort,
            cipher,
            encrypted: params.is_set(),
            stream: None,
            scratch: Vec::new(),
        }
    }

    /// Destination port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Establish the TCP connection, trying every resolved address once.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Resolve`] is fatal; [`ConnectError::Connect`] is
    /// worth retrying.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        let addrs = (self.dest.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Resolve {
                dest: self.dest.clone(),
                port: self.port,
                source,
            })?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(%err, "cannot set TCP_NODELAY");
                    }
                    if self.config.send_buffer_size > 0 {
                        let sock = socket2::SockRef::from(&stream);
                        if let Err(err) = sock.set_send_buffer_size(self.config.send_buffer_size)
                        {
                            warn!(%err, "cannot set send buffer size");
                        }
                    }
                    debug!(dest = %self.dest, port = self.port, "connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(ConnectError::Connect {
            dest: self.dest.clone(),
            port: self.port,
            source: last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses")
            }),
        })
    }

    /// Read exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// [`SocketError::Timeout`] when no bytes arrive within the read
    /// timeout, [`SocketError::UnexpectedEof`] on early close,
    /// [`SocketError::Aborted`] when the abort checker fires.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<(), SocketError> {
        let timeout = self.config.read_timeout();
        self.read_full_with_timeout(buf, timeout)
    }

    /// Read a single command byte with the configured read timeout
    ///
    /// # Errors
    ///
    /// Same contract as [`read_full`](Self::read_full).
    pub fn read_u8(&mut self) -> Result<u8, SocketError> {
        let mut byte = [0u8; 1];
        self.read_full(&mut byte)?;
        Ok(byte[0])
    }

    /// Read a single command byte with an explicit timeout
    ///
    /// # Errors
    ///
    /// Same contract as [`read_full`](Self::read_full).
    pub fn read_u8_with_timeout(&mut self, timeout: Duration) -> Result<u8, SocketError> {
        let mut byte = [0u8; 1];
        self.read_full_with_timeout(&mut byte, timeout)?;
        Ok(byte[0])
    }

    fn read_full_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(), SocketError> {
        let abort_interval = self.config.abort_interval();
        let stream = self.stream.as_mut().ok_or(SocketError::NotConnected)?;
        let abort = &*self.abort;
        let mut read_so_far = 0usize;
        let mut deadline = Instant::now() + timeout;
        while read_so_far < buf.len() {
            if abort.should_abort() {
                return Err(SocketError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SocketError::Timeout);
            }
            stream.set_read_timeout(Some((deadline - now).min(abort_interval)))?;
            match stream.read(&mut buf[read_so_far..]) {
                Ok(0) => return Err(SocketError::UnexpectedEof),
                Ok(n) => {
                    read_so_far += n;
                    // Progress restarts the timeout window.
                    deadline = Instant::now() + timeout;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(SocketError::Io(err)),
            }
        }
        self.cipher.decrypt(buf);
        Ok(())
    }

    /// Write all of `data`, encrypting it when the connection is encrypted.
    ///
    /// # Errors
    ///
    /// [`SocketError::Timeout`] when the peer stops draining for a full
    /// write timeout, [`SocketError::Aborted`] when the abort checker fires.
    pub fn write_full(&mut self, data: &[u8]) -> Result<(), SocketError> {
        if !self.encrypted {
            return self.write_plain(data, None);
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend_from_slice(data);
        self.cipher.encrypt(&mut scratch);
        let result = self.write_plain(&[], Some(&scratch));
        self.scratch = scratch;
        result
    }

    fn write_plain(&mut self, direct: &[u8], owned: Option<&[u8]>) -> Result<(), SocketError> {
        let data = owned.unwrap_or(direct);
        let abort_interval = self.config.abort_interval();
        let timeout = self.config.write_timeout();
        let stream = self.stream.as_mut().ok_or(SocketError::NotConnected)?;
        let abort = &*self.abort;
        let mut written = 0usize;
        let mut deadline = Instant::now() + timeout;
        while written < data.len() {
            if abort.should_abort() {
                return Err(SocketError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SocketError::Timeout);
            }
            stream.set_write_timeout(Some((deadline - now).min(abort_interval)))?;
            match stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(SocketError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "wrote zero bytes",
                    )));
                }
                Ok(n) => {
                    written += n;
                    deadline = Instant::now() + timeout;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(SocketError::Io(err)),
            }
        }
        Ok(())
    }

    /// Shut down the write half of the connection
    ///
    /// # Errors
    ///
    /// Returns [`SocketError`] when the socket is unconnected or the
    /// shutdown syscall fails.
    pub fn shutdown_writes(&mut self) -> Result<(), SocketError> {
        let stream = self.stream.as_mut().ok_or(SocketError::NotConnected)?;
        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    /// Expect the logical and physical end of the stream.
    ///
    /// # Errors
    ///
    /// [`SocketError::UnexpectedData`] when the peer sends more bytes
    /// instead of closing; timeout and I/O errors pass through.
    pub fn expect_end_of_stream(&mut self) -> Result<(), SocketError> {
        let mut byte = [0u8; 1];
        match self.read_full(&mut byte) {
            Err(SocketError::UnexpectedEof) => Ok(()),
            Ok(()) => Err(SocketError::UnexpectedData),
            Err(err) => Err(err),
        }
    }

    /// Bytes sitting unacknowledged in the kernel send buffer.
    ///
    /// Returns `None` when the probe is unavailable (non-Linux platforms or
    /// a failed ioctl).
    #[must_use]
    pub fn unacked_send_bytes(&self) -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            let stream = self.stream.as_ref()?;
            let mut outq: libc::c_int = 0;
            // SAFETY: the fd is a valid open socket and TIOCOUTQ writes a
            // single c_int.
            let ret =
                unsafe { libc::ioctl(stream.as_raw_fd(), libc::TIOCOUTQ, &raw mut outq) };
            if ret != 0 || outq < 0 {
                return None;
            }
            Some(outq as u64)
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    /// Current incremental authentication tag of the outgoing stream
    #[must_use]
    pub fn compute_cur_encryption_tag(&mut self) -> Vec<u8> {
        self.cipher.compute_cur_tag()
    }

    /// Close the connection without any end-of-stream ceremony
    pub fn close(&mut self) {
        self.stream = None;
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocket")
            .field("dest", &self.dest)
            .field("port", &self.port)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

/// Capability constructing client sockets, injectable for testing and for
/// alternative transports
pub trait SocketFactory: Send + Sync {
    /// Build an unconnected socket for one receiver port.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError`] when no cipher is available for the
    /// requested encryption parameters.
    fn make_socket(
        &self,
        dest: &str,
        port: u16,
        config: &SocketConfig,
        params: &EncryptionParams,
        abort: Arc<dyn AbortChecker>,
    ) -> Result<ClientSocket, CipherError>;
}

/// Factory producing plain [`ClientSocket`]s with ciphers from the
/// configured provider
pub struct DefaultSocketFactory {
    provider: Arc<dyn CipherProvider>,
}

impl DefaultSocketFactory {
    /// Factory with an explicit cipher provider
    #[must_use]
    pub fn new(provider: Arc<dyn CipherProvider>) -> Self {
        Self { provider }
    }
}

impl Default for DefaultSocketFactory {
    fn default() -> Self {
        Self::new(Arc::new(PlainTextProvider))
    }
}

impl SocketFactory for DefaultSocketFactory {
    fn make_socket(
        &self,
        dest: &str,
        port: u16,
        config: &SocketConfig,
        params: &EncryptionParams,
        abort: Arc<dyn AbortChecker>,
    ) -> Result<ClientSocket, CipherError> {
        let cipher = self.provider.make_cipher(params)?;
        Ok(ClientSocket::new(
            dest,
            port,
            config.clone(),
            params,
            cipher,
            abort,
        ))
    }
}
