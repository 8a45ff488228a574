use bytes::Bytes;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use meshroom::mesh::FileAssembler;
use meshroom::protocol::{IceCandidate, ParticipantId, RelayMessage, RoomId, Signal};

/// a targeted candidate message, the most frequent relay traffic
fn candidate_message() -> RelayMessage {
    RelayMessage::new(
        RoomId::from("bench-room"),
        ParticipantId::from("k3j9x0aa"),
        Signal::Candidate {
            candidate: Some(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.168.1.100 54321 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: Some("abcd".to_string()),
            }),
        },
    )
    .to(ParticipantId::from("p0q1w2e3"))
}

/// relay message parsing benchmark
fn bench_parsing(c: &mut Criterion) {
    let json = candidate_message().to_json().unwrap();

    let mut group = c.benchmark_group("Parsing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("RelayMessage", |b| {
        b.iter(|| {
            let msg = RelayMessage::from_json(black_box(&json)).unwrap();
            black_box(msg)
        })
    });

    group.finish();
}

/// relay message encoding benchmark
fn bench_encoding(c: &mut Criterion) {
    let msg = candidate_message();

    let mut group = c.benchmark_group("Encoding");
    group.throughput(Throughput::Elements(1));

    group.bench_function("RelayMessage", |b| {
        b.iter(|| {
            let json = black_box(&msg).to_json().unwrap();
            black_box(json)
        })
    });

    group.finish();
}

/// name + payload reassembly benchmark
fn bench_file_assembly(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xAB; 64 * 1024]);

    let mut group = c.benchmark_group("FileAssembly");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("64KiB", |b| {
        let mut assembler = FileAssembler::new();
        b.iter(|| {
            assembler.accept_name("bench.bin".to_string());
            let file = assembler.accept_chunk(black_box(payload.clone())).unwrap();
            black_box(file)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_parsing, bench_encoding, bench_file_assembly);
criterion_main!(benches);
