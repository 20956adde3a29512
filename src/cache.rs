//! [`NodeCache`] — global LRU + per-tree active list over loaded
//! [`NodeDescriptor`]s (spec.md §4.5). The cache is the one place that
//! moves a descriptor between a tree's active list and the global LRU;
//! every other module only ever holds and drops `Arc<NodeDescriptor>`
//! handles obtained from it.
//!
//! Lock ordering, enforced by construction here: **LRU → tree → node**
//! (spec.md §5). The single `lru_lock` below stands for spec.md's "LRU
//! lock" — it protects both the LRU list and the allocation path for new
//! descriptors, exactly as §4.5 "Atomicity of first look-up" specifies.

use std::sync::Arc;

use log::{trace, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::descriptor::{Membership, NodeDescriptor};
use crate::error::{Error, ErrorKind, Result};
use crate::node::format::NodeFormat;
use crate::node::{peek_node_type_id, resolve_format};
use crate::segaddr::SegAddr;
use crate::segalloc::{SegAlloc, Tx};
use crate::tree_descriptor::TreeDescriptor;

struct State {
    index: FxHashMap<u64, Arc<NodeDescriptor>>,
    /// Front = least recently used (purge target); back = most recently
    /// moved to LRU.
    lru_order: Vec<u64>,
}

pub struct NodeCache {
    segalloc: Arc<dyn SegAlloc>,
    state: Mutex<State>,
}

impl NodeCache {
    pub fn new(segalloc: Arc<dyn SegAlloc>) -> Self {
        NodeCache {
            segalloc,
            state: Mutex::new(State { index: FxHashMap::default(), lru_order: Vec::new() }),
        }
    }

    /// Returns a descriptor for the node at `addr`, attached to `tree`'s
    /// active list, with its refcount incremented (spec.md §4.5 `get`).
    pub fn get(&self, tree: &Arc<TreeDescriptor>, addr: SegAddr) -> Result<Arc<NodeDescriptor>> {
        let mut state = self.state.lock();

        if let Some(nd) = state.index.get(&addr.raw()).cloned() {
            if nd.membership() == Membership::Lru {
                let _tree_guard = tree.lock();
                let _node_guard = nd.write_lock();
                state.lru_order.retain(|&a| a != addr.raw());
                tree.active_add(addr);
                nd.set_tree_slot(Some(tree.slot()));
                nd.set_membership(Membership::Active);
            }
            nd.incref();
            trace!("cache: get hit addr={:?} refcount={}", addr, nd.ref_count());
            return Ok(nd);
        }

        let segment = self.segalloc.get(addr)?;
        let type_id = peek_node_type_id(segment.as_ref());
        let format = resolve_format(type_id)?;
        // `verify` (checksum/footer) rather than the cheaper `is_valid` is
        // used specifically here: this is the one path where bytes come
        // straight from the segment allocator rather than from an already
        // cache-resident, engine-mutated node, so it's the only place a
        // corrupted-on-disk node could actually be observed.
        if !format.verify(segment.as_ref()) {
            warn!("cache: node at {:?} failed verify on load", addr);
            return Err(Error::from(ErrorKind::DataFault(addr)));
        }

        let nd = Arc::new(NodeDescriptor::new_active(addr, segment, format, tree.slot()));
        nd.set_opaque_hint(addr.raw());
        {
            let _tree_guard = tree.lock();
            let _node_guard = nd.write_lock();
            tree.active_add(addr);
        }
        state.index.insert(addr.raw(), nd.clone());
        trace!("cache: get loaded addr={:?}", addr);
        Ok(nd)
    }

    /// Releases one reference to `nd` (spec.md §4.5 `put`). When the
    /// refcount reaches zero, detaches the node from `tree`'s active list,
    /// attaches it to the LRU, clears `seq`, and — if `delayed_free` was
    /// already set — performs the physical release immediately instead.
    pub fn put(&self, tree: &Arc<TreeDescriptor>, nd: &Arc<NodeDescriptor>, tx: &dyn Tx) -> Result<()> {
        let mut state = self.state.lock();
        let _tree_guard = tree.lock();
        let _node_guard = nd.write_lock();

        let remaining = nd.decref();
        if remaining > 0 {
            return Ok(());
        }

        tree.active_remove(nd.addr);
        nd.set_tree_slot(None);
        nd.reset_seq();

        if nd.delayed_free() {
            state.index.remove(&nd.addr.raw());
            nd.format.fini(nd.segment.as_ref(), tx)?;
            self.segalloc.free(nd.addr, tx)?;
            trace!("cache: put drained delayed-free node addr={:?}", nd.addr);
        } else {
            nd.set_membership(Membership::Lru);
            state.lru_order.push(nd.addr.raw());
            trace!("cache: put moved addr={:?} to LRU", nd.addr);
        }
        Ok(())
    }

    /// Allocates a new node, initializes its persistent header via
    /// `format.init`, and registers a descriptor on `tree`'s active list
    /// with `ref_count = 1` (spec.md §4.5 `alloc`).
    pub fn alloc(
        &self,
        tree: &Arc<TreeDescriptor>,
        shift: u8,
        format: Arc<dyn NodeFormat>,
        ksize: u16,
        vsize: u16,
        tx: &dyn Tx,
    ) -> Result<Arc<NodeDescriptor>> {
        let mut state = self.state.lock();

        let addr = self.segalloc.alloc(shift, tx)?;
        let segment = self.segalloc.get(addr)?;
        format.init(segment.as_ref(), shift, ksize, vsize, tree.tree_type, tx)?;

        let nd = Arc::new(NodeDescriptor::new_active(addr, segment, format, tree.slot()));
        nd.set_opaque_hint(addr.raw());
        {
            let _tree_guard = tree.lock();
            let _node_guard = nd.write_lock();
            tree.active_add(addr);
        }
        state.index.insert(addr.raw(), nd.clone());
        trace!("cache: alloc addr={:?}", addr);
        Ok(nd)
    }

    /// Marks `nd` for physical release (spec.md §4.5 `free`): decrements
    /// its refcount and sets `delayed_free`; if the refcount has already
    /// reached zero, releases it immediately.
    pub fn free(&self, tree: &Arc<TreeDescriptor>, nd: &Arc<NodeDescriptor>, tx: &dyn Tx) -> Result<()> {
        let mut state = self.state.lock();
        let _tree_guard = tree.lock();
        let _node_guard = nd.write_lock();

        nd.set_delayed_free(true);
        let remaining = nd.decref();
        if remaining > 0 {
            trace!("cache: free deferred addr={:?} refcount={}", nd.addr, remaining);
            return Ok(());
        }

        tree.active_remove(nd.addr);
        nd.set_tree_slot(None);
        state.index.remove(&nd.addr.raw());
        nd.format.fini(nd.segment.as_ref(), tx)?;
        self.segalloc.free(nd.addr, tx)?;
        trace!("cache: free released addr={:?} immediately", nd.addr);
        Ok(())
    }

    /// Evicts up to `count` zero-`tx_ref` descriptors from the LRU tail
    /// (spec.md §4.5 `lru_purge`). Returns the number actually evicted.
    pub fn lru_purge(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0usize;
        let mut cursor = 0usize;

        while evicted < count && cursor < state.lru_order.len() {
            let raw = state.lru_order[cursor];
            let purgeable = state.index.get(&raw).map(|nd| nd.tx_ref() == 0).unwrap_or(false);
            if purgeable {
                state.lru_order.remove(cursor);
                state.index.remove(&raw);
                evicted += 1;
            } else {
                cursor += 1;
            }
        }
        trace!("cache: lru_purge evicted {evicted} descriptors");
        evicted
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn lru_len(&self) -> usize {
        self.state.lock().lru_order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fixed::{FixedFormat, FIXED_FORMAT_TYPE_ID};
    use crate::segalloc::{MemSegAlloc, NullTx};

    fn fresh_cache_and_tree() -> (NodeCache, Arc<TreeDescriptor>) {
        let segalloc: Arc<dyn SegAlloc> = Arc::new(MemSegAlloc::new((4 << 20) / 512));
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

    #[test]
    fn alloc_then_get_returns_same_descriptor() {
        let (cache, tree) = fresh_cache_and_tree();
        let tx = NullTx;
        let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
        let nd = cache.alloc(&tree, 12, format, 8, 8, &tx).unwrap();
        assert_eq!(nd.ref_count(), 1);

        let nd2 = cache.get(&tree, nd.addr).unwrap();
        assert_eq!(nd2.ref_count(), 2);
        assert_eq!(Arc::as_ptr(&nd), Arc::as_ptr(&nd2));
    }

    #[test]
    fn put_to_zero_moves_to_lru() {
        let (cache, tree) = fresh_cache_and_tree();
        let tx = NullTx;
        let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
        let nd = cache.alloc(&tree, 12, format, 8, 8, &tx).unwrap();
        assert_eq!(tree.active_count(), 2); // root + new node

        cache.put(&tree, &nd, &tx).unwrap();
        assert_eq!(nd.membership(), Membership::Lru);
        assert_eq!(cache.lru_len(), 1);
        assert_eq!(tree.active_count(), 1);
    }

    #[test]
    fn free_with_refcount_zero_releases_immediately() {
        let (cache, tree) = fresh_cache_and_tree();
        let tx = NullTx;
        let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
        let nd = cache.alloc(&tree, 12, format, 8, 8, &tx).unwrap();
        let addr = nd.addr;

        cache.free(&tree, &nd, &tx).unwrap();
        assert_eq!(cache.resident_count(), 1); // only root remains
        assert!(cache.get(&tree, addr).is_err());
    }

    #[test]
    fn lru_purge_respects_tx_ref() {
        let (cache, tree) = fresh_cache_and_tree();
        let tx = NullTx;
        let format: Arc<dyn NodeFormat> = Arc::new(FixedFormat::new());
        let nd = cache.alloc(&tree, 12, format, 8, 8, &tx).unwrap();
        nd.inc_tx_ref();
        cache.put(&tree, &nd, &tx).unwrap();

        assert_eq!(cache.lru_purge(10), 0); // still referenced by an open tx
        nd.dec_tx_ref();
        assert_eq!(cache.lru_purge(10), 1);
    }

    const _: u32 = FIXED_FORMAT_TYPE_ID;
}
