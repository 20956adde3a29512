//! [`NodeDescriptor`] — the in-memory handle for one cached node (spec.md
//! §3/§4.3). Ownership follows spec.md §9's re-architecture note: the
//! cache owns the descriptor; callers hold ref-counted `Arc` handles;
//! physical free happens when the last handle drops while `delayed_free`
//! is set. List membership (tree active list / global LRU) is tracked as
//! plain data here — the actual lists live in [`crate::cache::NodeCache`]
//! and [`crate::tree_descriptor::TreeDescriptor`], keyed by address, rather
//! than as intrusive links on this struct.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::node::format::NodeFormat;
use crate::segaddr::SegAddr;
use crate::segalloc::Segment;

/// Which of the two lists currently claims a descriptor (spec.md §3
/// invariants). `Transit` is the brief window while the cache moves a
/// descriptor between lists, held only while the relevant locks are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Active,
    Lru,
    Transit,
}

/// In-memory handle for one loaded node.
pub struct NodeDescriptor {
    pub addr: SegAddr,
    pub segment: Arc<dyn Segment>,
    pub format: Arc<dyn NodeFormat>,

    /// Slot index into the engine's tree-descriptor pool that currently
    /// owns this node on its active list; `None` while on the global LRU.
    tree_slot: RwLock<Option<usize>>,
    ref_count: AtomicU32,
    tx_ref: AtomicU32,
    seq: AtomicU64,
    delayed_free: AtomicBool,
    membership: RwLock<Membership>,

    /// Per-node lock serializing structural mutation and CHECK validation
    /// (spec.md §5 "Node lock").
    lock: RwLock<()>,
}

impl NodeDescriptor {
    /// Builds a descriptor with `ref_count = 1`, attached to `tree_slot`'s
    /// active list — the state a freshly-`alloc`'d or freshly-`get`'d node
    /// is handed to its caller in.
    pub fn new_active(
        addr: SegAddr,
        segment: Arc<dyn Segment>,
        format: Arc<dyn NodeFormat>,
        tree_slot: usize,
    ) -> Self {
        NodeDescriptor {
            addr,
            segment,
            format,
            tree_slot: RwLock::new(Some(tree_slot)),
            ref_count: AtomicU32::new(1),
            tx_ref: AtomicU32::new(0),
            seq: AtomicU64::new(0),
            delayed_free: AtomicBool::new(false),
            membership: RwLock::new(Membership::Active),
            lock: RwLock::new(()),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn tx_ref(&self) -> u32 {
        self.tx_ref.load(Ordering::Acquire)
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Bumps the sequence number. Called by the cache/op layer after any
    /// `NodeFormat` call that may have mutated the node — `NodeFormat`
    /// itself never touches `seq`, since it is explicitly in-memory-only
    /// state (spec.md §3) with no persistent counterpart.
    pub fn touch(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clears the sequence counter when the descriptor leaves the active
    /// set for the LRU (spec.md §4.5 `put`: "...clear `seq`").
    pub fn reset_seq(&self) {
        self.seq.store(0, Ordering::Release);
    }

    pub fn delayed_free(&self) -> bool {
        self.delayed_free.load(Ordering::Acquire)
    }

    pub fn set_delayed_free(&self, v: bool) {
        self.delayed_free.store(v, Ordering::Release);
    }

    pub fn membership(&self) -> Membership {
        *self.membership.read()
    }

    pub fn set_membership(&self, m: Membership) {
        *self.membership.write() = m;
    }

    pub fn tree_slot(&self) -> Option<usize> {
        *self.tree_slot.read()
    }

    pub fn set_tree_slot(&self, slot: Option<usize>) {
        *self.tree_slot.write() = slot;
    }

    /// Increments the refcount (a fresh handle was checked out).
    pub fn incref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the refcount. Decrementing a zero refcount is a caller
    /// bug (spec.md §4.3 "never decrement a zero refcount (fatal)").
    pub fn decref(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "NodeDescriptor refcount underflow at {:?}", self.addr);
        prev - 1
    }

    pub fn inc_tx_ref(&self) -> u32 {
        self.tx_ref.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_tx_ref(&self) -> u32 {
        let prev = self.tx_ref.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "NodeDescriptor tx_ref underflow at {:?}", self.addr);
        prev - 1
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    /// Reads the persistent back-pointer hint. Per spec.md §9, this is
    /// never dereferenced as a pointer — only compared against a
    /// caller-supplied correlation id under the cache's lock.
    pub fn opaque_hint(&self) -> u64 {
        self.format.opaque_get(self.segment.as_ref())
    }

    pub fn set_opaque_hint(&self, hint: u64) {
        self.format.opaque_set(self.segment.as_ref(), hint);
    }
}

impl std::fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("addr", &self.addr)
            .field("ref_count", &self.ref_count())
            .field("tx_ref", &self.tx_ref())
            .field("seq", &self.seq())
            .field("delayed_free", &self.delayed_free())
            .field("membership", &self.membership())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fixed::FixedFormat;
    use crate::segalloc::{MemSegAlloc, NullTx, SegAlloc};

    fn descriptor() -> NodeDescriptor {
        let alloc = MemSegAlloc::new((1 << 20) / 512);
        let tx = NullTx;
        let addr = alloc.alloc(12, &tx).unwrap();
        let seg = alloc.get(addr).unwrap();
        let format = Arc::new(FixedFormat::new());
        format.init(seg.as_ref(), 12, 8, 8, 1, &tx).unwrap();
        NodeDescriptor::new_active(addr, seg, format, 0)
    }

    #[test]
    fn refcount_lifecycle() {
        let nd = descriptor();
        assert_eq!(nd.ref_count(), 1);
        assert_eq!(nd.incref(), 2);
        assert_eq!(nd.decref(), 1);
        assert_eq!(nd.decref(), 0);
    }

    #[test]
    #[should_panic]
    fn decref_below_zero_is_fatal() {
        let nd = descriptor();
        nd.decref();
        nd.decref();
    }

    #[test]
    fn touch_bumps_seq_monotonically() {
        let nd = descriptor();
        assert_eq!(nd.seq(), 0);
        assert_eq!(nd.touch(), 1);
        assert_eq!(nd.touch(), 2);
    }
}
