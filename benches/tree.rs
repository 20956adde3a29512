use std::sync::Arc;

use bplustree_storage_stack::{Engine, EngineConfig, MemSegAlloc, NullTx, SegAlloc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn fresh_engine() -> Engine {
    let segalloc: Arc<dyn SegAlloc> = Arc::new(MemSegAlloc::new((256 << 20) / 512));
    Engine::new(segalloc, EngineConfig::default())
}

fn sequential_insert(c: &mut Criterion) {
    let tx = NullTx;

    c.bench_function("tree_sequential_insert_1k", |b| {
        b.iter(|| {
            let engine = fresh_engine();
            let handle = engine.create_tree(1, 12, 8, 8, &tx).unwrap();
            for i in 0u64..1000 {
                let key = i.to_be_bytes().to_vec();
                handle.put(&key, &key, &tx).unwrap();
            }
            black_box(handle.height());
        })
    });
}

fn get_after_fill(c: &mut Criterion) {
    let tx = NullTx;
    let engine = fresh_engine();
    let handle = engine.create_tree(1, 12, 8, 8, &tx).unwrap();
    for i in 0u64..1000 {
        let key = i.to_be_bytes().to_vec();
        handle.put(&key, &key, &tx).unwrap();
    }

    c.bench_function("tree_get_from_1k", |b| {
        b.iter(|| {
            let key = 500u64.to_be_bytes();
            let rec = handle.get(black_box(&key), &tx).unwrap();
            black_box(rec);
        })
    });
}

criterion_group!(benches, sequential_insert, get_after_fill);
criterion_main!(benches);
