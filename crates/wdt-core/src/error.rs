//! Flat error taxonomy shared across threads, reports and the wire.

use wdt_files::SourceError;
use wdt_files::queue::QueueStatus;
use wdt_transport::SocketError;

/// Error kinds of the transfer engine.
///
/// These travel on the wire (abort frames, block status bytes) and appear
/// in per-thread and per-source report entries, so the numeric values are
/// part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    #[default]
    Ok = 0,
    /// Connection could not be established
    ConnError = 1,
    /// Read from an established connection failed
    SocketReadError = 2,
    /// Write to an established connection failed
    SocketWriteError = 3,
    /// An operation timed out
    WdtTimeout = 4,
    /// Reading a source file failed
    ByteSourceReadError = 5,
    /// The peer violated the protocol
    ProtocolError = 6,
    /// A checkpoint did not fit the transfer history
    InvalidCheckpoint = 7,
    /// Reconnects stopped making progress
    NoProgress = 8,
    /// The transfer was aborted
    Abort = 9,
    /// The peers disagree on the protocol version
    VersionMismatch = 10,
    /// The peer requires a protocol version this sender cannot speak
    VersionIncompatible = 11,
    /// The thread was forced off its history by a global checkpoint
    GlobalCheckpointAbort = 12,
    /// A required buffer could not be allocated
    MemoryAllocationError = 13,
}

impl ErrorCode {
    /// Whether this is the success code
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Whether a reconnect may clear this condition
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ConnError | Self::SocketReadError | Self::SocketWriteError | Self::WdtTimeout
        )
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ConnError),
            2 => Ok(Self::SocketReadError),
            3 => Ok(Self::SocketWriteError),
            4 => Ok(Self::WdtTimeout),
            5 => Ok(Self::ByteSourceReadError),
            6 => Ok(Self::ProtocolError),
            7 => Ok(Self::InvalidCheckpoint),
            8 => Ok(Self::NoProgress),
            9 => Ok(Self::Abort),
            10 => Ok(Self::VersionMismatch),
            11 => Ok(Self::VersionIncompatible),
            12 => Ok(Self::GlobalCheckpointAbort),
            13 => Ok(Self::MemoryAllocationError),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::ConnError => "CONN_ERROR",
            Self::SocketReadError => "SOCKET_READ_ERROR",
            Self::SocketWriteError => "SOCKET_WRITE_ERROR",
            Self::WdtTimeout => "WDT_TIMEOUT",
            Self::ByteSourceReadError => "BYTE_SOURCE_READ_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InvalidCheckpoint => "INVALID_CHECKPOINT",
            Self::NoProgress => "NO_PROGRESS",
            Self::Abort => "ABORT",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::VersionIncompatible => "VERSION_INCOMPATIBLE",
            Self::GlobalCheckpointAbort => "GLOBAL_CHECKPOINT_ABORT",
            Self::MemoryAllocationError => "MEMORY_ALLOCATION_ERROR",
        };
        f.write_str(name)
    }
}

impl From<&SocketError> for ErrorCode {
    fn from(err: &SocketError) -> Self {
        match err {
            SocketError::Timeout => Self::WdtTimeout,
            SocketError::Aborted => Self::Abort,
            SocketError::UnexpectedEof
            | SocketError::UnexpectedData
            | SocketError::NotConnected
            | SocketError::Io(_) => Self::SocketReadError,
        }
    }
}

impl From<&SourceError> for ErrorCode {
    fn from(_err: &SourceError) -> Self {
        Self::ByteSourceReadError
    }
}

impl From<QueueStatus> for ErrorCode {
    fn from(status: QueueStatus) -> Self {
        match status {
            QueueStatus::Ok => Self::Ok,
            QueueStatus::SourceError => Self::ByteSourceReadError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        for code in 0..=13 {
            let parsed = ErrorCode::try_from(code).unwrap();
            assert_eq!(parsed as i32, code);
        }
        assert_eq!(ErrorCode::try_from(99), Err(99));
    }

    #[test]
    fn test_transient_codes() {
        assert!(ErrorCode::ConnError.is_transient());
        assert!(ErrorCode::WdtTimeout.is_transient());
        assert!(!ErrorCode::ProtocolError.is_transient());
        assert!(!ErrorCode::Abort.is_transient());
    }
}
