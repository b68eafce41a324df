use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use wdt_core::protocol::{self, BlockDetails, Checkpoint};
use wdt_core::ErrorCode;
use wdt_files::FileAllocationStatus;

fn sample_details(name_len: usize) -> BlockDetails {
    BlockDetails {
        file_name: "d/".repeat(name_len / 2),
        seq_id: 123_456,
        file_size: 1 << 33,
        offset: 48 * 1024 * 1024,
        data_size: 16 * 1024 * 1024,
        allocation_status: FileAllocationStatus::ExistsTooSmall,
        prev_seq_id: 42,
    }
}

fn bench_header_encode(c: &mut Criterion) {
    let details = sample_details(64);
    let encoded = protocol::encode_file_header(ErrorCode::Ok, &details);

    let mut group = c.benchmark_group("header_encode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_64_byte_name", |b| {
        b.iter(|| protocol::encode_file_header(ErrorCode::Ok, black_box(&details)))
    });
    group.finish();
}

fn bench_header_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_decode");
    for (name_len, label) in [(16usize, "16_byte_name"), (64, "64_byte_name"), (256, "256_byte_name")] {
        let encoded = protocol::encode_file_header(ErrorCode::Ok, &sample_details(name_len));
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(label, |b| {
            b.iter(|| protocol::decode_block_details(black_box(&encoded[4..])).unwrap())
        });
    }
    group.finish();
}

fn bench_checkpoint_roundtrip(c: &mut Criterion) {
    let checkpoint = Checkpoint {
        port: 22356,
        num_blocks: 1024,
        last_block_received_bytes: 12_345_678,
    };

    c.bench_function("local_checkpoint_roundtrip", |b| {
        b.iter(|| {
            let frame = protocol::encode_local_checkpoint(black_box(&checkpoint));
            protocol::decode_local_checkpoint(&frame).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_header_encode,
    bench_header_decode,
    bench_checkpoint_roundtrip
);
criterion_main!(benches);
