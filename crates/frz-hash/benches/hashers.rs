//! Throughput of the hash families behind content IDs.
//!
//! Run with: cargo bench --package frz-hash

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use frz_hash::{blake3_factory, sha256_factory, sha512_256_factory, HasherFactory};

fn bench_families(c: &mut Criterion) {
    let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let families: [(&str, HasherFactory<32>); 3] = [
        ("blake3", blake3_factory()),
        ("sha256", sha256_factory()),
        ("sha512_256", sha512_256_factory()),
    ];

    let mut group = c.benchmark_group("hash_8mib");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    for (name, factory) in &families {
        group.bench_with_input(BenchmarkId::from_parameter(name), &payload, |b, payload| {
            b.iter(|| {
                let mut hasher = factory();
                hasher.update(payload);
                black_box(hasher.finish())
            });
        });
    }
    group.finish();
}

fn bench_id_codec(c: &mut Criterion) {
    let mut hasher = blake3_factory()();
    hasher.update(b"codec payload");
    let id = frz_hash::ContentId::new(hasher.finish(), 123_456_789);
    let encoded = id.to_base32();

    c.bench_function("id_encode", |b| b.iter(|| black_box(id.to_base32())));
    c.bench_function("id_decode", |b| {
        b.iter(|| black_box(frz_hash::ContentId::<32>::from_base32(&encoded).unwrap()))
    });
}

criterion_group!(benches, bench_families, bench_id_codec);
criterion_main!(benches);
