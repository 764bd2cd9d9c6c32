//! 패킷 코덱 / 봉인 벤치마크
//!
//! 실행: cargo bench --bench packet_codec

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ndt::packet::Block;
use ndt::{CryptoSession, KeyPair, PacketCodec, PeerId, SessionKey};

fn blocks(count: usize, size: usize) -> Vec<Block> {
    (0..count)
        .map(|i| Block::new(i as u32, Bytes::from(vec![i as u8; size])))
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let codec = PacketCodec::default();
    let mut group = c.benchmark_group("encode");

    let single = blocks(1, codec.max_block_payload());
    group.throughput(Throughput::Bytes(codec.max_block_payload() as u64));
    group.bench_function("single_max_block", |b| {
        b.iter(|| codec.encode(PeerId(1), black_box(&single), &[]))
    });

    // 여러 패킷으로 나뉘는 배치
    let batch = blocks(64, 40);
    group.throughput(Throughput::Bytes(64 * 40));
    group.bench_function("coalesce_64x40B", |b| {
        b.iter(|| {
            let mut rest = black_box(batch.as_slice());
            while !rest.is_empty() {
                let encoded = codec.encode(PeerId(1), rest, &[]).unwrap();
                rest = &rest[encoded.blocks_taken..];
            }
        })
    });

    let acks: Vec<u32> = (0..200).collect();
    group.bench_function("ack_only_200", |b| {
        b.iter(|| codec.encode(PeerId(1), &[], black_box(&acks)))
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let codec = PacketCodec::default();
    let encoded = codec.encode(PeerId(1), &blocks(4, 100), &[1, 2, 3]).unwrap();

    c.bench_function("decode_4x100B", |b| {
        b.iter(|| codec.decode(black_box(&encoded.bytes)))
    });
}

fn bench_seal(c: &mut Criterion) {
    let codec = PacketCodec::default();
    let session = CryptoSession::new(KeyPair::generate());
    session.install_session_key(PeerId(2), &SessionKey::generate());

    let plain = codec
        .encode(PeerId(1), &blocks(1, codec.max_block_payload()), &[])
        .unwrap();
    let sealed = session.seal_packet(PeerId(2), &plain.bytes).unwrap();

    let mut group = c.benchmark_group("seal");
    group.throughput(Throughput::Bytes(plain.bytes.len() as u64));
    group.bench_function("seal_full_packet", |b| {
        b.iter(|| session.seal_packet(PeerId(2), black_box(&plain.bytes)))
    });
    group.bench_function("open_full_packet", |b| {
        b.iter(|| session.open_packet(PeerId(2), black_box(&sealed)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_seal);
criterion_main!(benches);
