use bytes::Bytes;
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use volmove::fallback::wire::{Attrs, Data, Entry, WirePath};
use volmove::protocol::{HeaderFlags, MigrationHeader, SnapshotDescriptor, TransferType};
use volmove::transport::frame::FRAME_HEADER_LEN;
use volmove::transport::WireMessage;

fn payload(frame: &Bytes) -> Bytes {
    frame.slice(FRAME_HEADER_LEN..)
}

fn bench_data_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame");

    for chunk_size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        let msg = Data {
            path: WirePath::new("var/lib/mysql/ibdata1").unwrap(),
            offset: 42 * 1024 * 1024,
            data: Bytes::from(vec![0xA5u8; *chunk_size]),
        };
        let encoded = msg.encode();
        group.throughput(Throughput::Bytes(*chunk_size as u64));

        group.bench_with_input(BenchmarkId::new("encode", chunk_size), chunk_size, |b, _| {
            b.iter(|| black_box(&msg).encode());
        });
        group.bench_with_input(BenchmarkId::new("decode", chunk_size), chunk_size, |b, _| {
            b.iter(|| Data::decode(payload(black_box(&encoded))).unwrap());
        });
    }
    group.finish();
}

fn bench_entry_frames(c: &mut Criterion) {
    let entries: Vec<Entry> = (0..1000)
        .map(|i| Entry {
            path: WirePath::new(format!("usr/share/doc/pkg{}/copyright", i)).unwrap(),
            size: 1500,
            attrs: Attrs {
                mode: 0o100644,
                mtime: 1_700_000_000 + i,
                uid: 0,
                gid: 0,
            },
        })
        .collect();
    let encoded: Vec<Bytes> = entries.iter().map(|e| e.encode()).collect();

    c.bench_function("entry_encode_1000", |b| {
        b.iter(|| {
            for entry in &entries {
                black_box(entry.encode());
            }
        })
    });
    c.bench_function("entry_decode_1000", |b| {
        b.iter(|| {
            for frame in &encoded {
                black_box(Entry::decode(payload(frame)).unwrap());
            }
        })
    });
}

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("migration_header");

    for snapshot_count in [0, 10, 100].iter() {
        let mut header = MigrationHeader::new(TransferType::Btrfs, HeaderFlags::LIVE);
        header.snapshots = (0..*snapshot_count)
            .map(|i| SnapshotDescriptor::new(format!("snap{}", i), Utc.timestamp_opt(i, 0).unwrap()))
            .collect();
        let encoded = header.encode();

        group.bench_with_input(
            BenchmarkId::new("roundtrip", snapshot_count),
            snapshot_count,
            |b, _| {
                b.iter(|| {
                    let frame = black_box(&header).encode();
                    MigrationHeader::decode(payload(&frame)).unwrap()
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("decode", snapshot_count),
            snapshot_count,
            |b, _| {
                b.iter(|| MigrationHeader::decode(payload(black_box(&encoded))).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_data_frames, bench_entry_frames, bench_header);
criterion_main!(benches);
