use std::sync::Arc;

use bplustree_storage_stack::node::fixed::FixedFormat;
use bplustree_storage_stack::node::format::NodeFormat;
use bplustree_storage_stack::{MemSegAlloc, NodeCache, NodeDescriptor, NullTx, SegAlloc, TreeDescriptor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn fresh_cache_and_tree() -> (NodeCache, Arc<TreeDescriptor>) {
    let segalloc: Arc<dyn SegAlloc> = Arc::new(MemSegAlloc::new((64 << 20) / 512));
    let cache = NodeCache::new(segalloc.clone());
    let tx = NullTx;
    let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
    let root_addr = segalloc.alloc(12, &tx).unwrap();
    let root_seg = segalloc.get(root_addr).unwrap();
    format.init(root_seg.as_ref(), 12, 8, 8, 1, &tx).unwrap();
    let root_nd = Arc::new(NodeDescriptor::new_active(root_addr, root_seg, format, 0));
    let tree = Arc::new(TreeDescriptor::new(0, 1, root_nd));
    (cache, tree)
}

fn alloc_put_roundtrip(c: &mut Criterion) {
    let (cache, tree) = fresh_cache_and_tree();
    let tx = NullTx;

    c.bench_function("cache_alloc_put_4k_node", |b| {
        b.iter(|| {
            let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
            let nd = cache.alloc(&tree, 12, format, 8, 8, &tx).unwrap();
            cache.put(&tree, black_box(&nd), &tx).unwrap();
        })
    });
}

fn get_hit(c: &mut Criterion) {
    let (cache, tree) = fresh_cache_and_tree();
    let tx = NullTx;
    let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
    let nd = cache.alloc(&tree, 12, format, 8, 8, &tx).unwrap();
    let addr = nd.addr;

    c.bench_function("cache_get_resident_hit", |b| {
        b.iter(|| {
            let got = cache.get(&tree, black_box(addr)).unwrap();
            cache.put(&tree, &got, &tx).unwrap();
        })
    });
}

criterion_group!(benches, alloc_put_roundtrip, get_hit);
criterion_main!(benches);
