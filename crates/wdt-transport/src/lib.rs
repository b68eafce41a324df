//! # WDT Transport
//!
//! Blocking network transport for the WDT sender:
//! - Abort-aware TCP client socket with full-read/full-write semantics
//! - Send-buffer drain probing (`SIOCOUTQ`) for post-DONE command reads
//! - Encryption parameters and the streaming-cipher capability seam

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod encryption;
pub mod socket;

pub use encryption::{
    CipherError, CipherProvider, EncryptionParams, EncryptionType, PlainTextCipher,
    PlainTextProvider, StreamCipher,
};
pub use socket::{
    AbortChecker, ClientSocket, ConnectError, DefaultSocketFactory, NeverAbort, SocketConfig,
    SocketError, SocketFactory,
};
