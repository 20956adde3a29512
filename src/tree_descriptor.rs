//! [`TreeDescriptor`] — per-open-tree in-memory state (spec.md §3/§4.4):
//! root, height, the tree's active-node list, and the tree lock used for
//! the CHECK→ACT critical section of every mutating operation (spec.md
//! §5).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::descriptor::NodeDescriptor;
use crate::segaddr::SegAddr;

/// Per-open-tree state, owned by one slot in the engine's fixed
/// tree-descriptor pool (spec.md §3 "Tree module singleton").
pub struct TreeDescriptor {
    /// This tree's own slot index in the engine's pool (spec.md §9:
    /// `NodeDescriptor::tree_slot` refers back to this). Stored as an
    /// atomic rather than a plain field: the real index is only known once
    /// `Engine::claim_slot` finds a free one, which happens after this
    /// descriptor is constructed (and already wrapped in an `Arc`).
    slot: AtomicUsize,
    pub tree_type: u32,

    root: RwLock<Arc<NodeDescriptor>>,
    height: AtomicU32,
    ref_count: AtomicU32,

    /// Write-locked during CHECK→ACT and during membership moves between
    /// this tree's active list and the global LRU (spec.md §5). Read-held
    /// acquisition is never used.
    lock: RwLock<()>,

    /// Addresses of nodes currently on this tree's active list (spec.md
    /// §3 `active_nodes`). The descriptors themselves live in the cache's
    /// index; this is a membership record, not the source of truth for
    /// node data.
    active_nodes: Mutex<Vec<u64>>,

    start_time: Instant,
}

impl TreeDescriptor {
    pub fn new(slot: usize, tree_type: u32, root: Arc<NodeDescriptor>) -> Self {
        let root_addr = root.addr.raw();
        TreeDescriptor {
            slot: AtomicUsize::new(slot),
            tree_type,
            root: RwLock::new(root),
            height: AtomicU32::new(1),
            ref_count: AtomicU32::new(1),
            lock: RwLock::new(()),
            active_nodes: Mutex::new(vec![root_addr]),
            start_time: Instant::now(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    /// Records the slot index actually assigned by `Engine::claim_slot`.
    pub fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Release);
    }

    pub fn root(&self) -> Arc<NodeDescriptor> {
        self.root.read().clone()
    }

    /// Returns the root descriptor with its refcount incremented, for
    /// callers that will treat it as an ordinary descended level entry and
    /// eventually release it through `NodeCache::put`/`free` (spec.md
    /// §4.5 `get`'s contract: "returns a descriptor ... incrementing its
    /// refcount"). The root's own `ref_count = 1` set at `create`/`open`
    /// time is the tree's permanent pin and must never be balanced by a
    /// `cache.put`; every temporary hold taken through `descend()` needs
    /// its own increment here so that pin survives the operation.
    pub fn root_ref(&self) -> Arc<NodeDescriptor> {
        let nd = self.root();
        nd.incref();
        nd
    }

    pub fn set_root(&self, nd: Arc<NodeDescriptor>) {
        *self.root.write() = nd;
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    pub fn set_height(&self, h: u32) {
        self.height.store(h, Ordering::Release);
    }

    pub fn incr_height(&self) -> u32 {
        self.height.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decr_height(&self) -> u32 {
        let prev = self.height.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "tree height underflow");
        prev - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn incref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decref(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "TreeDescriptor refcount underflow");
        prev - 1
    }

    /// Acquires the tree's write lock (the only mode ever used, per
    /// spec.md §5 "Read-held is not used; all acquisitions are
    /// exclusive").
    pub fn lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    pub fn try_lock(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.lock.try_write()
    }

    pub fn active_add(&self, addr: SegAddr) {
        self.active_nodes.lock().push(addr.raw());
    }

    pub fn active_remove(&self, addr: SegAddr) {
        let mut list = self.active_nodes.lock();
        if let Some(pos) = list.iter().position(|&a| a == addr.raw()) {
            list.swap_remove(pos);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_nodes.lock().len()
    }

    pub fn active_addrs(&self) -> Vec<u64> {
        self.active_nodes.lock().clone()
    }

    pub fn elapsed_since_open(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl std::fmt::Debug for TreeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeDescriptor")
            .field("slot", &self.slot())
            .field("height", &self.height())
            .field("ref_count", &self.ref_count())
            .field("active_count", &self.active_count())
            .finish()
    }
}
