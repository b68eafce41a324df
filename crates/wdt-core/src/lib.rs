//! # WDT Core
//!
//! Warp-speed data transfer: the sender side of a multi-connection file
//! transfer engine. A set of regular files is streamed to a receiver over
//! N parallel TCP connections, with resumption, cross-thread checkpoint
//! propagation and protocol-version renegotiation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Sender                                  │
//! │   (threads, global abort, version agreement, final report)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Sender threads                              │
//! │   (one 14-state protocol engine per receiver port)              │
//! ├───────────────────────────┬─────────────────────────────────────┤
//! │     Directory queue       │        Transfer histories            │
//! │  (discovery, block fan-   │  (per-thread ledgers, local and      │
//! │   out, retransmission)    │   global checkpoints)                │
//! └───────────────────────────┴─────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod error;
pub mod history;
pub mod options;
pub mod protocol;
pub mod report;
pub mod request;
pub mod sender;
mod sender_thread;
pub mod throttler;

pub use coordinator::{FunnelStatus, ThreadCoordinator};
pub use error::ErrorCode;
pub use history::{CheckpointApply, ThreadTransferHistory, TransferHistoryController};
pub use options::WdtOptions;
pub use protocol::{
    BlockDetails, Checkpoint, Cmd, DecodeError, FooterType, PROTOCOL_VERSION, Settings,
};
pub use report::{ProgressReporter, TransferReport, TransferStats};
pub use request::{RequestError, WdtTransferRequest, WdtUri};
pub use sender::{NegotiationStatus, Sender, TransferStatus};
pub use throttler::Throttler;
