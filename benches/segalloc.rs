use std::sync::Arc;

use bplustree_storage_stack::{MemSegAlloc, NullTx, SegAlloc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn alloc_free_roundtrip(c: &mut Criterion) {
    let alloc = Arc::new(MemSegAlloc::new((64 << 20) / 512));
    let tx = NullTx;

    c.bench_function("segalloc_alloc_free_4k", |b| {
        b.iter(|| {
            let addr = alloc.alloc(12, &tx).unwrap();
            alloc.free(black_box(addr), &tx).unwrap();
        })
    });
}

fn read_write_roundtrip(c: &mut Criterion) {
    let alloc = Arc::new(MemSegAlloc::new((64 << 20) / 512));
    let tx = NullTx;
    let addr = alloc.alloc(12, &tx).unwrap();
    let segment = alloc.get(addr).unwrap();
    let payload = vec![0xABu8; 4096];
    let mut out = vec![0u8; 4096];

    c.bench_function("segalloc_segment_read_write_4k", |b| {
        b.iter(|| {
            segment.write_at(0, black_box(&payload));
            segment.read_at(0, black_box(&mut out));
        })
    });
}

criterion_group!(benches, alloc_free_roundtrip, read_write_roundtrip);
criterion_main!(benches);
