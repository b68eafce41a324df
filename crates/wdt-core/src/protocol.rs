//! Wire protocol: command bytes, varints and frame codecs.
//!
//! Multi-byte fixed-width fields are big-endian except where a field is
//! explicitly little-endian for historical reasons (the block-header length,
//! the ERR frame length and the chunk-batch length prefix). Variable-width
//! integers are LEB128 varints; signed values travel as their two's
//! complement bit pattern.

use crate::error::ErrorCode;
use thiserror::Error;
use wdt_files::{FileAllocationStatus, FileChunksInfo, Interval};

/// Current protocol version
pub const PROTOCOL_VERSION: i32 = 30;
/// Oldest protocol version this sender can fall back to
pub const MIN_PROTOCOL_VERSION: i32 = 24;
/// Version from which the receiver expects a SIZE command for progress
/// reporting
pub const RECEIVER_PROGRESS_REPORT_VERSION: i32 = 26;
/// Version from which checksum footers are supported
pub const CHECKSUM_VERSION: i32 = 27;
/// Version from which download resumption is supported
pub const DOWNLOAD_RESUMPTION_VERSION: i32 = 28;
/// Version from which encryption tags are verified incrementally per block
pub const INCREMENTAL_TAG_VERIFICATION_VERSION: i32 = 29;

/// Max length of a transfer id
pub const MAX_TRANSFER_ID_LENGTH: usize = 50;
/// Frames the receiver reads eagerly (SETTINGS with resumption, DONE) are
/// padded to this length so it can issue one uniform read
pub const MIN_BUF_LENGTH: usize = 256;
/// Fixed length of the local-checkpoint frame: a one-entry checkpoint list,
/// zero padded
pub const LOCAL_CHECKPOINT_FRAME_LEN: usize = 31;
/// Fixed length of the abort frame body (i32 version, i32 error, i64
/// checkpoint)
pub const ABORT_FRAME_LEN: usize = 16;
/// Fixed length of the chunks-command body (i64 buffer size, i64 file count)
pub const CHUNKS_CMD_LEN: usize = 16;
/// Upper bound of an encoded block header, for buffer sizing
pub const MAX_HEADER_LEN: usize = 4 * 1024 + 128;

/// Command bytes.
///
/// `LocalCheckpoint` doubles as the entry count of a one-checkpoint list,
/// which is what a local-checkpoint frame is; the overlap is load-bearing
/// for backward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    /// One-entry checkpoint list sent by the receiver on reconnect
    LocalCheckpoint = 0x01,
    /// Session abort, optionally carrying a version-mismatch negotiation
    Abort = 0x41,
    /// Resumption manifest follows
    Chunks = 0x43,
    /// End of blocks (sender) / all blocks verified (receiver)
    Done = 0x44,
    /// Global checkpoint list follows
    Err = 0x45,
    /// Block footer with checksum or encryption tag
    Footer = 0x46,
    /// Block header and data follow
    File = 0x4C,
    /// Transfer settings follow
    Settings = 0x53,
    /// Receiver still waiting on other connections
    Wait = 0x57,
    /// Total transfer size follows
    Size = 0x5A,
    /// Acknowledgment
    Ack = 0x61,
}

impl TryFrom<u8> for Cmd {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(Self::LocalCheckpoint),
            0x41 => Ok(Self::Abort),
            0x43 => Ok(Self::Chunks),
            0x44 => Ok(Self::Done),
            0x45 => Ok(Self::Err),
            0x46 => Ok(Self::Footer),
            0x4C => Ok(Self::File),
            0x53 => Ok(Self::Settings),
            0x57 => Ok(Self::Wait),
            0x5A => Ok(Self::Size),
            0x61 => Ok(Self::Ack),
            other => Err(DecodeError::InvalidCmd(other)),
        }
    }
}

/// Frame decode errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes for the field being decoded
    #[error("frame too short")]
    TooShort,

    /// A varint ran past ten bytes
    #[error("varint overflow")]
    VarintOverflow,

    /// A string field is not UTF-8
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// Unknown command byte
    #[error("invalid command byte: 0x{0:02X}")]
    InvalidCmd(u8),

    /// Unknown allocation status value
    #[error("invalid allocation status: {0}")]
    InvalidAllocationStatus(u8),

    /// Unknown error-code value
    #[error("invalid error code: {0}")]
    InvalidErrorCode(i32),

    /// A checkpoint list had an unusable entry count
    #[error("unexpected checkpoint count: {0}")]
    UnexpectedCheckpointCount(u64),

    /// A numeric field does not fit its domain
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}

/// Footer flavour appended after each block's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FooterType {
    /// No footer
    None,
    /// CRC-32C of the block data
    Checksum,
    /// Incremental AEAD tag from the encryption layer
    EncTag,
}

/// Receiver-side progress marker: `num_blocks` complete blocks plus
/// `last_block_received_bytes` bytes of the following block were received
/// on `port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Port (and thereby thread) the checkpoint belongs to
    pub port: i32,
    /// Fully received block count; -1 flags a receiver that crashed while
    /// sending DONE
    pub num_blocks: i64,
    /// Bytes received of the first incomplete block
    pub last_block_received_bytes: i64,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checkpoint[port={} blocks={} partial={}]",
            self.port, self.num_blocks, self.last_block_received_bytes
        )
    }
}

/// Settings exchanged right after connecting
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Settings {
    /// Sender read timeout, advisory for the receiver
    pub read_timeout_ms: u64,
    /// Sender write timeout, advisory for the receiver
    pub write_timeout_ms: u64,
    /// Transfer id, must match on both ends
    pub transfer_id: String,
    /// Whether block footers carry checksums
    pub enable_checksum: bool,
    /// Whether the sender wants the resumption manifest
    pub send_file_chunks: bool,
    /// Whether files travel as single blocks
    pub block_mode_disabled: bool,
}

/// Header fields of one FILE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDetails {
    /// File name relative to the transfer root
    pub file_name: String,
    /// Sequence id of the file
    pub seq_id: i64,
    /// Size of the whole file
    pub file_size: u64,
    /// Block offset within the file
    pub offset: u64,
    /// Number of data bytes following the header
    pub data_size: u64,
    /// Receiver-side allocation status
    pub allocation_status: FileAllocationStatus,
    /// Sequence id from a previous transfer, -1 when not resuming
    pub prev_seq_id: i64,
}

// ---------------------------------------------------------------------------
// varints

pub(crate) fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

pub(crate) fn encode_varint_i64(buf: &mut Vec<u8>, value: i64) {
    encode_varint(buf, value as u64);
}

/// Byte-slice cursor used by the decoders
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Decoder<'a> {
    /// Cursor over `buf` starting at offset zero
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Bytes consumed so far
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.off
    }

    /// Bytes left
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.off).ok_or(DecodeError::TooShort)?;
        self.off += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::TooShort);
        }
        let slice = &self.buf[self.off..self.off + len];
        self.off += len;
        Ok(slice)
    }

    fn i32_be(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64_be(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.bytes(8)?;
        Ok(i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift >= 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow);
            }
        }
    }

    fn varint_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.varint()? as i64)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::OutOfRange("string length"))?;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

fn encode_string(buf: &mut Vec<u8>, value: &str) {
    encode_varint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

// ---------------------------------------------------------------------------
// settings

const SETTINGS_FLAG_CHECKSUM: u8 = 0b0000_0001;
const SETTINGS_FLAG_FILE_CHUNKS: u8 = 0b0000_0010;
const SETTINGS_FLAG_NO_BLOCK_MODE: u8 = 0b0000_0100;

/// Append the encoded settings body (without the command byte)
pub fn encode_settings(buf: &mut Vec<u8>, settings: &Settings) {
    debug_assert!(settings.transfer_id.len() <= MAX_TRANSFER_ID_LENGTH);
    encode_varint(buf, settings.read_timeout_ms);
    encode_varint(buf, settings.write_timeout_ms);
    encode_string(buf, &settings.transfer_id);
    let mut flags = 0u8;
    if settings.enable_checksum {
        flags |= SETTINGS_FLAG_CHECKSUM;
    }
    if settings.send_file_chunks {
        flags |= SETTINGS_FLAG_FILE_CHUNKS;
    }
    if settings.block_mode_disabled {
        flags |= SETTINGS_FLAG_NO_BLOCK_MODE;
    }
    buf.push(flags);
}

/// Decode a settings body.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated or malformed input.
pub fn decode_settings(decoder: &mut Decoder<'_>) -> Result<Settings, DecodeError> {
    let read_timeout_ms = decoder.varint()?;
    let write_timeout_ms = decoder.varint()?;
    let transfer_id = decoder.string()?;
    if transfer_id.len() > MAX_TRANSFER_ID_LENGTH {
        return Err(DecodeError::OutOfRange("transfer id length"));
    }
    let flags = decoder.u8()?;
    Ok(Settings {
        read_timeout_ms,
        write_timeout_ms,
        transfer_id,
        enable_checksum: flags & SETTINGS_FLAG_CHECKSUM != 0,
        send_file_chunks: flags & SETTINGS_FLAG_FILE_CHUNKS != 0,
        block_mode_disabled: flags & SETTINGS_FLAG_NO_BLOCK_MODE != 0,
    })
}

// ---------------------------------------------------------------------------
// block header

/// Encode a complete FILE frame header: command byte, status byte, a
/// little-endian length of the remainder, then the block details.
#[must_use]
pub fn encode_file_header(status: ErrorCode, details: &BlockDetails) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + details.file_name.len());
    buf.push(Cmd::File as u8);
    buf.push(status as i32 as u8);
    buf.extend_from_slice(&[0, 0]);
    encode_varint_i64(&mut buf, details.seq_id);
    encode_varint(&mut buf, details.file_size);
    encode_varint(&mut buf, details.offset);
    encode_varint(&mut buf, details.data_size);
    encode_varint(&mut buf, u64::from(details.allocation_status as u8));
    encode_varint_i64(&mut buf, details.prev_seq_id);
    encode_string(&mut buf, &details.file_name);
    let body_len = (buf.len() - 4) as u16;
    buf[2..4].copy_from_slice(&body_len.to_le_bytes());
    buf
}

/// Decode the block details of a FILE frame (the bytes after the four-byte
/// prefix).
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated or malformed input.
pub fn decode_block_details(body: &[u8]) -> Result<BlockDetails, DecodeError> {
    let mut decoder = Decoder::new(body);
    let seq_id = decoder.varint_i64()?;
    let file_size = decoder.varint()?;
    let offset = decoder.varint()?;
    let data_size = decoder.varint()?;
    let status_raw = decoder.varint()?;
    let status_raw =
        u8::try_from(status_raw).map_err(|_| DecodeError::OutOfRange("allocation status"))?;
    let allocation_status = FileAllocationStatus::try_from(status_raw)
        .map_err(DecodeError::InvalidAllocationStatus)?;
    let prev_seq_id = decoder.varint_i64()?;
    let file_name = decoder.string()?;
    Ok(BlockDetails {
        file_name,
        seq_id,
        file_size,
        offset,
        data_size,
        allocation_status,
        prev_seq_id,
    })
}

// ---------------------------------------------------------------------------
// checkpoints

/// Append an encoded checkpoint list: a varint count, then the entries
pub fn encode_checkpoint_list(buf: &mut Vec<u8>, checkpoints: &[Checkpoint]) {
    encode_varint(buf, checkpoints.len() as u64);
    for cp in checkpoints {
        encode_varint_i64(buf, i64::from(cp.port));
        encode_varint_i64(buf, cp.num_blocks);
        encode_varint_i64(buf, cp.last_block_received_bytes);
    }
}

/// Decode a checkpoint list.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated input or an oversized count.
pub fn decode_checkpoint_list(decoder: &mut Decoder<'_>) -> Result<Vec<Checkpoint>, DecodeError> {
    let count = decoder.varint()?;
    if count > 1024 {
        return Err(DecodeError::UnexpectedCheckpointCount(count));
    }
    let mut checkpoints = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let port = decoder.varint_i64()?;
        let port = i32::try_from(port).map_err(|_| DecodeError::OutOfRange("port"))?;
        let num_blocks = decoder.varint_i64()?;
        let last_block_received_bytes = decoder.varint_i64()?;
        checkpoints.push(Checkpoint {
            port,
            num_blocks,
            last_block_received_bytes,
        });
    }
    Ok(checkpoints)
}

/// Encode the fixed-length local-checkpoint frame: a one-entry checkpoint
/// list, zero padded. The leading count byte is what makes the frame start
/// with [`Cmd::LocalCheckpoint`].
#[must_use]
pub fn encode_local_checkpoint(checkpoint: &Checkpoint) -> [u8; LOCAL_CHECKPOINT_FRAME_LEN] {
    let mut body = Vec::with_capacity(LOCAL_CHECKPOINT_FRAME_LEN);
    encode_checkpoint_list(&mut body, std::slice::from_ref(checkpoint));
    debug_assert!(body.len() <= LOCAL_CHECKPOINT_FRAME_LEN);
    let mut frame = [0u8; LOCAL_CHECKPOINT_FRAME_LEN];
    frame[..body.len()].copy_from_slice(&body);
    frame
}

/// Decode a fixed-length local-checkpoint frame.
///
/// # Errors
///
/// Returns [`DecodeError::UnexpectedCheckpointCount`] unless the frame
/// holds exactly one checkpoint.
pub fn decode_local_checkpoint(frame: &[u8]) -> Result<Checkpoint, DecodeError> {
    let mut decoder = Decoder::new(frame);
    let checkpoints = decode_checkpoint_list(&mut decoder)?;
    if checkpoints.len() != 1 {
        return Err(DecodeError::UnexpectedCheckpointCount(
            checkpoints.len() as u64
        ));
    }
    Ok(checkpoints[0])
}

// ---------------------------------------------------------------------------
// done / size / footer

/// Encode a complete DONE frame, padded to [`MIN_BUF_LENGTH`]
#[must_use]
pub fn encode_done(status: ErrorCode, num_blocks: u64, total_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_BUF_LENGTH);
    buf.push(Cmd::Done as u8);
    buf.push(status as i32 as u8);
    encode_varint(&mut buf, num_blocks);
    encode_varint(&mut buf, total_size);
    buf.resize(MIN_BUF_LENGTH, 0);
    buf
}

/// Decode the body of a DONE frame (the bytes after the command byte).
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated input or an unknown status byte.
pub fn decode_done(decoder: &mut Decoder<'_>) -> Result<(ErrorCode, u64, u64), DecodeError> {
    let status_raw = decoder.u8()?;
    let status = ErrorCode::try_from(i32::from(status_raw))
        .map_err(DecodeError::InvalidErrorCode)?;
    let num_blocks = decoder.varint()?;
    let total_size = decoder.varint()?;
    Ok((status, num_blocks, total_size))
}

/// Encode a complete SIZE frame
#[must_use]
pub fn encode_size_cmd(total_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.push(Cmd::Size as u8);
    encode_varint(&mut buf, total_size);
    buf
}

/// Decode the body of a SIZE frame.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated input.
pub fn decode_size_cmd(decoder: &mut Decoder<'_>) -> Result<u64, DecodeError> {
    decoder.varint()
}

/// Encode a complete FOOTER frame: checksum plus an optional encryption tag
#[must_use]
pub fn encode_footer(checksum: u32, tag: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + 5 + tag.len());
    buf.push(Cmd::Footer as u8);
    encode_varint(&mut buf, u64::from(checksum));
    encode_varint(&mut buf, tag.len() as u64);
    buf.extend_from_slice(tag);
    buf
}

/// Decode the body of a FOOTER frame.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated input or an oversized tag.
pub fn decode_footer(decoder: &mut Decoder<'_>) -> Result<(u32, Vec<u8>), DecodeError> {
    let checksum = decoder.varint()?;
    let checksum =
        u32::try_from(checksum).map_err(|_| DecodeError::OutOfRange("checksum"))?;
    let tag_len = decoder.varint()?;
    if tag_len > 64 {
        return Err(DecodeError::OutOfRange("tag length"));
    }
    let tag = decoder.bytes(tag_len as usize)?.to_vec();
    Ok((checksum, tag))
}

// ---------------------------------------------------------------------------
// abort / chunks

/// Encode the fixed abort frame body (without the command byte)
#[must_use]
pub fn encode_abort(protocol_version: i32, error: ErrorCode, checkpoint: i64) -> [u8; ABORT_FRAME_LEN] {
    let mut frame = [0u8; ABORT_FRAME_LEN];
    frame[0..4].copy_from_slice(&protocol_version.to_be_bytes());
    frame[4..8].copy_from_slice(&(error as i32).to_be_bytes());
    frame[8..16].copy_from_slice(&checkpoint.to_be_bytes());
    frame
}

/// Decode the fixed abort frame body.
///
/// # Errors
///
/// Returns [`DecodeError::InvalidErrorCode`] on an unknown error value.
pub fn decode_abort(frame: &[u8]) -> Result<(i32, ErrorCode, i64), DecodeError> {
    let mut decoder = Decoder::new(frame);
    let protocol_version = decoder.i32_be()?;
    let error_raw = decoder.i32_be()?;
    let error = ErrorCode::try_from(error_raw).map_err(DecodeError::InvalidErrorCode)?;
    let checkpoint = decoder.i64_be()?;
    Ok((protocol_version, error, checkpoint))
}

/// Encode the fixed chunks-command body (without the command byte)
#[must_use]
pub fn encode_chunks_cmd(buf_size: i64, num_files: i64) -> [u8; CHUNKS_CMD_LEN] {
    let mut frame = [0u8; CHUNKS_CMD_LEN];
    frame[0..8].copy_from_slice(&buf_size.to_be_bytes());
    frame[8..16].copy_from_slice(&num_files.to_be_bytes());
    frame
}

/// Decode the fixed chunks-command body.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] on truncated input.
pub fn decode_chunks_cmd(frame: &[u8]) -> Result<(i64, i64), DecodeError> {
    let mut decoder = Decoder::new(frame);
    let buf_size = decoder.i64_be()?;
    let num_files = decoder.i64_be()?;
    Ok((buf_size, num_files))
}

/// Append one encoded manifest entry
pub fn encode_file_chunks_info(buf: &mut Vec<u8>, info: &FileChunksInfo) {
    encode_varint_i64(buf, info.seq_id);
    encode_string(buf, &info.file_name);
    encode_varint(buf, info.file_size);
    encode_varint(buf, info.chunks.len() as u64);
    for chunk in &info.chunks {
        encode_varint(buf, chunk.start);
        encode_varint(buf, chunk.end);
    }
}

/// Decode one manifest entry.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated or malformed input.
pub fn decode_file_chunks_info(decoder: &mut Decoder<'_>) -> Result<FileChunksInfo, DecodeError> {
    let seq_id = decoder.varint_i64()?;
    let file_name = decoder.string()?;
    let file_size = decoder.varint()?;
    let num_chunks = decoder.varint()?;
    if num_chunks > 1 << 20 {
        return Err(DecodeError::OutOfRange("chunk count"));
    }
    let mut info = FileChunksInfo::new(seq_id, file_name, file_size);
    for _ in 0..num_chunks {
        let start = decoder.varint()?;
        let end = decoder.varint()?;
        if end < start {
            return Err(DecodeError::OutOfRange("chunk interval"));
        }
        info.add_chunk(Interval::new(start, end));
    }
    Ok(info)
}

/// Decode every manifest entry in `data`, appending to `out`.
///
/// # Errors
///
/// Returns [`DecodeError`] on truncated or malformed input.
pub fn decode_file_chunks_info_list(
    data: &[u8],
    out: &mut Vec<FileChunksInfo>,
) -> Result<(), DecodeError> {
    let mut decoder = Decoder::new(data);
    while decoder.remaining() > 0 {
        out.push(decode_file_chunks_info(&mut decoder)?);
    }
    Ok(())
}

/// Batch manifest entries into buffers of at most `buf_size` bytes, one
/// entry minimum per batch. Used by the receiver side of the protocol and
/// by test doubles.
#[must_use]
pub fn encode_file_chunks_info_list(infos: &[FileChunksInfo], buf_size: usize) -> Vec<Vec<u8>> {
    let mut batches: Vec<Vec<u8>> = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for info in infos {
        let mut encoded = Vec::new();
        encode_file_chunks_info(&mut encoded, info);
        if !current.is_empty() && current.len() + encoded.len() > buf_size {
            batches.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&encoded);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ---------------------------------------------------------------------------
// version negotiation

/// Version agreement rule: the requested version wins when this sender can
/// speak it, a lower common version otherwise, 0 when no agreement exists.
#[must_use]
pub fn negotiate_protocol(requested: i32, current: i32) -> i32 {
    if requested < MIN_PROTOCOL_VERSION {
        0
    } else if requested <= current {
        requested
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_varint(value: u64) -> u64 {
        let mut buf = Vec::new();
        encode_varint(&mut buf, value);
        Decoder::new(&buf).varint().unwrap()
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            assert_eq!(roundtrip_varint(value), value);
        }
    }

    #[test]
    fn test_varint_i64_negative() {
        let mut buf = Vec::new();
        encode_varint_i64(&mut buf, -1);
        assert_eq!(buf.len(), 10);
        assert_eq!(Decoder::new(&buf).varint_i64().unwrap(), -1);
    }

    #[test]
    fn test_varint_truncated() {
        let buf = [0x80u8, 0x80];
        assert_eq!(Decoder::new(&buf).varint(), Err(DecodeError::TooShort));
    }

    #[test]
    fn test_cmd_roundtrip() {
        for cmd in [
            Cmd::LocalCheckpoint,
            Cmd::Abort,
            Cmd::Chunks,
            Cmd::Done,
            Cmd::Err,
            Cmd::Footer,
            Cmd::File,
            Cmd::Settings,
            Cmd::Wait,
            Cmd::Size,
            Cmd::Ack,
        ] {
            assert_eq!(Cmd::try_from(cmd as u8).unwrap(), cmd);
        }
        assert!(matches!(
            Cmd::try_from(0x7F),
            Err(DecodeError::InvalidCmd(0x7F))
        ));
    }

    #[test]
    fn test_settings_roundtrip() {
        let settings = Settings {
            read_timeout_ms: 5000,
            write_timeout_ms: 6000,
            transfer_id: "transfer-123".into(),
            enable_checksum: true,
            send_file_chunks: false,
            block_mode_disabled: true,
        };
        let mut buf = Vec::new();
        encode_settings(&mut buf, &settings);
        let decoded = decode_settings(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_file_header_roundtrip() {
        let details = BlockDetails {
            file_name: "dir/some file.bin".into(),
            seq_id: 42,
            file_size: 1 << 33,
            offset: 16 * 1024 * 1024,
            data_size: 16 * 1024 * 1024,
            allocation_status: FileAllocationStatus::ExistsTooSmall,
            prev_seq_id: 17,
        };
        let header = encode_file_header(ErrorCode::Ok, &details);
        assert_eq!(header[0], Cmd::File as u8);
        assert_eq!(header[1], ErrorCode::Ok as i32 as u8);
        let body_len = u16::from_le_bytes([header[2], header[3]]) as usize;
        assert_eq!(body_len, header.len() - 4);
        let decoded = decode_block_details(&header[4..]).unwrap();
        assert_eq!(decoded, details);
    }

    #[test]
    fn test_file_header_carries_status() {
        let details = BlockDetails {
            file_name: "x".into(),
            seq_id: 0,
            file_size: 1,
            offset: 0,
            data_size: 1,
            allocation_status: FileAllocationStatus::NotExists,
            prev_seq_id: -1,
        };
        let header = encode_file_header(ErrorCode::ByteSourceReadError, &details);
        assert_eq!(
            ErrorCode::try_from(i32::from(header[1])).unwrap(),
            ErrorCode::ByteSourceReadError
        );
    }

    #[test]
    fn test_checkpoint_list_roundtrip() {
        let checkpoints = vec![
            Checkpoint {
                port: 22356,
                num_blocks: 17,
                last_block_received_bytes: 1024,
            },
            Checkpoint {
                port: 22357,
                num_blocks: 0,
                last_block_received_bytes: 0,
            },
        ];
        let mut buf = Vec::new();
        encode_checkpoint_list(&mut buf, &checkpoints);
        let decoded = decode_checkpoint_list(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(decoded, checkpoints);
    }

    #[test]
    fn test_local_checkpoint_frame() {
        let cp = Checkpoint {
            port: 22356,
            num_blocks: 3,
            last_block_received_bytes: 524_288,
        };
        let frame = encode_local_checkpoint(&cp);
        assert_eq!(frame[0], Cmd::LocalCheckpoint as u8);
        assert_eq!(decode_local_checkpoint(&frame).unwrap(), cp);
    }

    #[test]
    fn test_local_checkpoint_receiver_died_marker() {
        let cp = Checkpoint {
            port: 1,
            num_blocks: -1,
            last_block_received_bytes: 0,
        };
        let frame = encode_local_checkpoint(&cp);
        assert_eq!(decode_local_checkpoint(&frame).unwrap().num_blocks, -1);
    }

    #[test]
    fn test_local_checkpoint_rejects_multi_entry() {
        let mut buf = Vec::new();
        let cp = Checkpoint {
            port: 1,
            num_blocks: 0,
            last_block_received_bytes: 0,
        };
        encode_checkpoint_list(&mut buf, &[cp, cp]);
        buf.resize(LOCAL_CHECKPOINT_FRAME_LEN.max(buf.len()), 0);
        assert!(matches!(
            decode_local_checkpoint(&buf),
            Err(DecodeError::UnexpectedCheckpointCount(2))
        ));
    }

    #[test]
    fn test_done_roundtrip() {
        let frame = encode_done(ErrorCode::Ok, 12, 987_654_321);
        assert_eq!(frame.len(), MIN_BUF_LENGTH);
        assert_eq!(frame[0], Cmd::Done as u8);
        let mut decoder = Decoder::new(&frame[1..]);
        let (status, blocks, total) = decode_done(&mut decoder).unwrap();
        assert_eq!(status, ErrorCode::Ok);
        assert_eq!(blocks, 12);
        assert_eq!(total, 987_654_321);
    }

    #[test]
    fn test_size_roundtrip() {
        let frame = encode_size_cmd(10 * 1024 * 1024);
        assert_eq!(frame[0], Cmd::Size as u8);
        let size = decode_size_cmd(&mut Decoder::new(&frame[1..])).unwrap();
        assert_eq!(size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_footer_roundtrip() {
        let frame = encode_footer(0xDEAD_BEEF, &[1, 2, 3, 4]);
        assert_eq!(frame[0], Cmd::Footer as u8);
        let (checksum, tag) = decode_footer(&mut Decoder::new(&frame[1..])).unwrap();
        assert_eq!(checksum, 0xDEAD_BEEF);
        assert_eq!(tag, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_footer_empty_tag() {
        let frame = encode_footer(7, &[]);
        let (checksum, tag) = decode_footer(&mut Decoder::new(&frame[1..])).unwrap();
        assert_eq!(checksum, 7);
        assert!(tag.is_empty());
    }

    #[test]
    fn test_abort_roundtrip() {
        let frame = encode_abort(29, ErrorCode::VersionMismatch, 5);
        assert_eq!(frame.len(), ABORT_FRAME_LEN);
        let (version, error, checkpoint) = decode_abort(&frame).unwrap();
        assert_eq!(version, 29);
        assert_eq!(error, ErrorCode::VersionMismatch);
        assert_eq!(checkpoint, 5);
    }

    #[test]
    fn test_chunks_cmd_roundtrip() {
        let frame = encode_chunks_cmd(64 * 1024, 7);
        let (buf_size, num_files) = decode_chunks_cmd(&frame).unwrap();
        assert_eq!(buf_size, 64 * 1024);
        assert_eq!(num_files, 7);
    }

    #[test]
    fn test_file_chunks_info_roundtrip() {
        let mut info = FileChunksInfo::new(3, "dir/file.bin", 100_000);
        info.add_chunk(Interval::new(0, 4096));
        info.add_chunk(Interval::new(8192, 20_000));
        let mut buf = Vec::new();
        encode_file_chunks_info(&mut buf, &info);
        let decoded = decode_file_chunks_info(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_file_chunks_list_batching() {
        let infos: Vec<FileChunksInfo> = (0..10)
            .map(|i| FileChunksInfo::new(i, format!("file-{i}.bin"), 1000))
            .collect();
        let batches = encode_file_chunks_info_list(&infos, 40);
        assert!(batches.len() > 1);
        let mut decoded = Vec::new();
        for batch in &batches {
            assert!(batch.len() <= 40 || batches.len() == 1);
            decode_file_chunks_info_list(batch, &mut decoded).unwrap();
        }
        assert_eq!(decoded, infos);
    }

    #[test]
    fn test_negotiate_protocol() {
        assert_eq!(negotiate_protocol(PROTOCOL_VERSION, PROTOCOL_VERSION), PROTOCOL_VERSION);
        assert_eq!(
            negotiate_protocol(PROTOCOL_VERSION - 1, PROTOCOL_VERSION),
            PROTOCOL_VERSION - 1
        );
        // Peer is newer than this sender: fall back to ours.
        assert_eq!(
            negotiate_protocol(PROTOCOL_VERSION + 5, PROTOCOL_VERSION),
            PROTOCOL_VERSION
        );
        // Peer is older than anything we can speak.
        assert_eq!(negotiate_protocol(MIN_PROTOCOL_VERSION - 1, PROTOCOL_VERSION), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_varint_roundtrip(value in any::<u64>()) {
                prop_assert_eq!(roundtrip_varint(value), value);
            }

            #[test]
            fn prop_block_details_roundtrip(
                name in "[a-zA-Z0-9_/.-]{1,64}",
                seq_id in 0i64..1_000_000,
                file_size in any::<u64>(),
                offset in any::<u64>(),
                data_size in any::<u64>(),
                status in 0u8..=4,
                prev_seq_id in -1i64..1_000_000,
            ) {
                let details = BlockDetails {
                    file_name: name,
                    seq_id,
                    file_size,
                    offset,
                    data_size,
                    allocation_status: FileAllocationStatus::try_from(status).unwrap(),
                    prev_seq_id,
                };
                let header = encode_file_header(ErrorCode::Ok, &details);
                let decoded = decode_block_details(&header[4..]).unwrap();
                prop_assert_eq!(decoded, details);
            }

            #[test]
            fn prop_checkpoint_roundtrip(
                port in 0i32..65_536,
                num_blocks in -1i64..1_000_000,
                partial in 0i64..1_000_000_000,
            ) {
                let cp = Checkpoint { port, num_blocks, last_block_received_bytes: partial };
                let frame = encode_local_checkpoint(&cp);
                prop_assert_eq!(decode_local_checkpoint(&frame).unwrap(), cp);
            }

            #[test]
            fn prop_decode_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = decode_block_details(&data);
                let _ = decode_local_checkpoint(&data);
                let _ = decode_settings(&mut Decoder::new(&data));
                let _ = decode_abort(&data);
                let mut out = Vec::new();
                let _ = decode_file_chunks_info_list(&data, &mut out);
            }
        }
    }
}
