//! End-to-end sender tests against a scripted receiver on loopback TCP.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use wdt_core::protocol::{
    self, BlockDetails, Checkpoint, Cmd, LOCAL_CHECKPOINT_FRAME_LEN, MIN_BUF_LENGTH,
};
use wdt_core::{ErrorCode, Sender, WdtOptions, WdtTransferRequest};

fn test_options() -> WdtOptions {
    WdtOptions {
        read_timeout_ms: 2000,
        write_timeout_ms: 2000,
        connect_timeout_ms: 1000,
        abort_check_interval_ms: 50,
        max_retries: 3,
        sleep_millis: 20,
        max_transfer_retries: 2,
        drain_extra_ms: 100,
        buffer_size: 64 * 1024,
        ..WdtOptions::default()
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_source_file(dir: &Path, name: &str, data: &[u8]) {
    std::fs::write(dir.join(name), data).unwrap();
}

// --- scripted receiver helpers -------------------------------------------

fn read_byte(stream: &mut TcpStream) -> u8 {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).unwrap();
    byte[0]
}

fn read_varint(stream: &mut TcpStream) -> u64 {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(stream);
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

#[derive(Debug)]
struct ReceivedSettings {
    transfer_id: String,
    enable_checksum: bool,
}

fn read_settings(stream: &mut TcpStream) -> ReceivedSettings {
    assert_eq!(read_byte(stream), Cmd::Settings as u8);
    let _read_timeout = read_varint(stream);
    let _write_timeout = read_varint(stream);
    let id_len = read_varint(stream) as usize;
    let mut id = vec![0u8; id_len];
    stream.read_exact(&mut id).unwrap();
    let flags = read_byte(stream);
    ReceivedSettings {
        transfer_id: String::from_utf8(id).unwrap(),
        enable_checksum: flags & 0b0000_0001 != 0,
    }
}

struct ReceivedBlock {
    details: BlockDetails,
    data: Vec<u8>,
    checksum: Option<u32>,
}

/// Read one FILE frame after its command byte was consumed
fn read_file_frame(stream: &mut TcpStream, with_footer: bool) -> ReceivedBlock {
    let _status = read_byte(stream);
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).unwrap();
    let body_len = u16::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).unwrap();
    let details = protocol::decode_block_details(&body).unwrap();

    let mut data = vec![0u8; details.data_size as usize];
    stream.read_exact(&mut data).unwrap();

    let checksum = if with_footer {
        assert_eq!(read_byte(stream), Cmd::Footer as u8);
        let checksum = read_varint(stream) as u32;
        let tag_len = read_varint(stream) as usize;
        let mut tag = vec![0u8; tag_len];
        stream.read_exact(&mut tag).unwrap();
        Some(checksum)
    } else {
        None
    };
    ReceivedBlock {
        details,
        data,
        checksum,
    }
}

/// Drive one connection up to (and including) the sender's DONE frame,
/// collecting the blocks that arrived on it
fn read_until_done(stream: &mut TcpStream, with_footer: bool) -> Vec<ReceivedBlock> {
    let mut blocks = Vec::new();
    loop {
        let cmd = read_byte(stream);
        if cmd == Cmd::Size as u8 {
            let _total = read_varint(stream);
        } else if cmd == Cmd::File as u8 {
            blocks.push(read_file_frame(stream, with_footer));
        } else if cmd == Cmd::Done as u8 {
            // The DONE frame is padded to a fixed length.
            let mut rest = vec![0u8; MIN_BUF_LENGTH - 1];
            stream.read_exact(&mut rest).unwrap();
            return blocks;
        } else {
            panic!("receiver script got unexpected cmd 0x{cmd:02X}");
        }
    }
}

/// Reply DONE, consume the sender's DONE ack and close cleanly
fn finish_connection(mut stream: TcpStream) {
    stream.write_all(&[Cmd::Done as u8]).unwrap();
    assert_eq!(read_byte(&mut stream), Cmd::Done as u8);
    // Dropping the stream is the logical end of stream the sender expects.
}

// --- scenarios ------------------------------------------------------------

#[test]
fn test_single_file_two_ports() {
    let dir = TempDir::new().unwrap();
    let data = patterned(10 * 1024 * 1024);
    write_source_file(dir.path(), "payload.bin", &data);

    let listeners: Vec<TcpListener> = (0..2)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let ports: Vec<u16> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();

    let expected = Arc::new(data);
    let receivers: Vec<_> = listeners
        .into_iter()
        .enumerate()
        .map(|(index, listener)| {
            let expected = Arc::clone(&expected);
            thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let settings = read_settings(&mut stream);
                assert_eq!(settings.transfer_id, "itest");
                assert!(settings.enable_checksum);
                let blocks = read_until_done(&mut stream, true);
                for block in &blocks {
                    assert_eq!(block.details.file_name, "payload.bin");
                    assert_eq!(
                        block.data[..],
                        expected[block.details.offset as usize
                            ..(block.details.offset + block.details.data_size) as usize]
                    );
                    assert_eq!(block.checksum, Some(crc32c::crc32c(&block.data)));
                }
                if index == 1 {
                    // One connection exercises the WAIT path first.
                    stream.write_all(&[Cmd::Wait as u8]).unwrap();
                }
                finish_connection(stream);
                blocks.iter().map(|b| b.data.len()).sum::<usize>()
            })
        })
        .collect();

    let mut request = WdtTransferRequest::new("127.0.0.1", 0, 0, dir.path());
    request.ports = ports;
    request.transfer_id = "itest".into();
    let mut sender = Sender::new(&request, test_options()).unwrap();
    let report = sender.transfer().unwrap();

    assert_eq!(report.error_code(), ErrorCode::Ok);
    assert_eq!(report.effective_data_bytes(), 10 * 1024 * 1024);
    assert_eq!(report.summary.num_blocks(), 1);
    assert!(report.failed_sources.is_empty());

    let received: usize = receivers.into_iter().map(|r| r.join().unwrap()).sum();
    assert_eq!(received, 10 * 1024 * 1024);
}

#[test]
fn test_reconnect_resumes_from_local_checkpoint() {
    let dir = TempDir::new().unwrap();
    let total = 4 * 1024 * 1024usize;
    let resume_at = 512 * 1024usize;
    let data = patterned(total);
    write_source_file(dir.path(), "resume.bin", &data);

    // Small receive buffer so the sender notices the dead peer while the
    // block is still in flight.
    let listener = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    listener.set_recv_buffer_size(16 * 1024).unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(4).unwrap();
    let listener: TcpListener = listener.into();
    let port = listener.local_addr().unwrap().port();

    let expected = Arc::new(data);
    let receiver = {
        let expected = Arc::clone(&expected);
        thread::spawn(move || {
            // First connection: take the settings, the block header and the
            // first 512 KiB of data, then reset the connection.
            let (mut stream, _) = listener.accept().unwrap();
            read_settings(&mut stream);
            let cmd = loop {
                let cmd = read_byte(&mut stream);
                if cmd == Cmd::Size as u8 {
                    let _total = read_varint(&mut stream);
                    continue;
                }
                break cmd;
            };
            assert_eq!(cmd, Cmd::File as u8);
            let _status = read_byte(&mut stream);
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).unwrap();
            let mut body = vec![0u8; u16::from_le_bytes(len_buf) as usize];
            stream.read_exact(&mut body).unwrap();
            let details = protocol::decode_block_details(&body).unwrap();
            assert_eq!(details.offset, 0);

            let mut first = vec![0u8; resume_at];
            stream.read_exact(&mut first).unwrap();
            assert_eq!(first[..], expected[..resume_at]);
            let raw = socket2::SockRef::from(&stream);
            raw.set_linger(Some(Duration::ZERO)).unwrap();
            drop(stream);

            // Second connection: hand the sender a local checkpoint for the
            // bytes that made it, then take the rest.
            let (mut stream, _) = listener.accept().unwrap();
            let checkpoint = Checkpoint {
                port: i32::from(port),
                num_blocks: 0,
                last_block_received_bytes: resume_at as i64,
            };
            let frame = protocol::encode_local_checkpoint(&checkpoint);
            assert_eq!(frame.len(), LOCAL_CHECKPOINT_FRAME_LEN);
            stream.write_all(&frame).unwrap();

            read_settings(&mut stream);
            let blocks = read_until_done(&mut stream, true);
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].details.offset as usize, resume_at);
            assert_eq!(blocks[0].details.data_size as usize, total - resume_at);
            assert_eq!(blocks[0].data[..], expected[resume_at..]);
            finish_connection(stream);
        })
    };

    let mut request = WdtTransferRequest::new("127.0.0.1", 0, 0, dir.path());
    request.ports = vec![port];
    let mut options = test_options();
    // One block per file, and a small send buffer so the write path fails
    // fast once the receiver is gone.
    options.block_size_mbytes = 0;
    options.send_buffer_size = 16 * 1024;
    let mut sender = Sender::new(&request, options).unwrap();
    let report = sender.transfer().unwrap();

    assert_eq!(report.error_code(), ErrorCode::Ok);
    assert!(report.num_reconnects() >= 1);
    assert_eq!(report.effective_data_bytes() as usize, total - resume_at);
    assert!(report.failed_sources.is_empty());
    receiver.join().unwrap();
}

#[test]
fn test_unexpected_command_is_protocol_error() {
    let dir = TempDir::new().unwrap();
    let data = patterned(128 * 1024);
    write_source_file(dir.path(), "small.bin", &data);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let receiver = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_settings(&mut stream);
        let blocks = read_until_done(&mut stream, true);
        assert_eq!(blocks.len(), 1);
        // Garbage instead of DONE/WAIT/ERR.
        stream.write_all(&[0x7F]).unwrap();
        // Hold the socket open until the sender gives up on its own.
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let mut request = WdtTransferRequest::new("127.0.0.1", 0, 0, dir.path());
    request.ports = vec![port];
    let mut sender = Sender::new(&request, test_options()).unwrap();
    let report = sender.transfer().unwrap();

    assert_ne!(report.error_code(), ErrorCode::Ok);
    assert_eq!(report.thread_stats.len(), 1);
    assert_eq!(
        report.thread_stats[0].local_error(),
        ErrorCode::ProtocolError
    );
    // The block was sent but never acknowledged.
    assert_eq!(report.failed_sources.len(), 1);
    assert_eq!(report.failed_sources[0].id(), Some("small.bin"));
    receiver.join().unwrap();
}

#[test]
fn test_abort_interrupts_transfer() {
    let dir = TempDir::new().unwrap();
    write_source_file(dir.path(), "big.bin", &patterned(4 * 1024 * 1024));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    // A receiver that accepts and then never reads.
    let receiver = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(5));
        drop(stream);
    });

    let mut request = WdtTransferRequest::new("127.0.0.1", 0, 0, dir.path());
    request.ports = vec![port];
    let mut options = test_options();
    options.send_buffer_size = 16 * 1024;
    let mut sender = Sender::new(&request, options).unwrap();
    sender.transfer_async().unwrap();

    thread::sleep(Duration::from_millis(300));
    sender.abort(ErrorCode::Abort);
    let report = sender.finish();

    assert_ne!(report.error_code(), ErrorCode::Ok);
    assert_eq!(report.thread_stats[0].local_error(), ErrorCode::Abort);
    receiver.join().unwrap();
}

#[test]
fn test_finish_is_idempotent() {
    let dir = TempDir::new().unwrap();
    write_source_file(dir.path(), "tiny.bin", &patterned(1024));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let receiver = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_settings(&mut stream);
        read_until_done(&mut stream, true);
        finish_connection(stream);
    });

    let mut request = WdtTransferRequest::new("127.0.0.1", 0, 0, dir.path());
    request.ports = vec![port];
    let mut sender = Sender::new(&request, test_options()).unwrap();
    let first = sender.transfer().unwrap();
    let second = sender.finish();

    assert_eq!(first.error_code(), second.error_code());
    assert_eq!(first.effective_data_bytes(), second.effective_data_bytes());
    assert_eq!(first.summary.num_blocks(), second.summary.num_blocks());
    receiver.join().unwrap();
}
