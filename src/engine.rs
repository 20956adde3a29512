//! [`Engine`] — owns the fixed tree-descriptor slot pool and the global
//! [`NodeCache`] (spec.md §3 "Tree module singleton", §4.4). [`TreeHandle`]
//! is the public façade: each call builds one [`OpStateMachine`] and drives
//! it to completion.

use std::sync::Arc;
use std::time::Instant;

use log::{info, trace, warn};
use parking_lot::Mutex;

use crate::cache::NodeCache;
use crate::config::EngineConfig;
use crate::cookie::Cookie;
use crate::descriptor::NodeDescriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::node::fixed::FIXED_FORMAT_TYPE_ID;
use crate::node::format::{NodeFormat, Record};
use crate::node::resolve_format;
use crate::op::{ActFlag, ActSlot, IterDirection, OpFlags, OpStateMachine, Opcode};
use crate::segaddr::SegAddr;
use crate::segalloc::{SegAlloc, Tx};
use crate::tree_descriptor::TreeDescriptor;

/// Owns the global cache and the fixed-size pool of [`TreeDescriptor`]
/// slots (spec.md §3/§5: the tree pool is bounded, `create`/`open` fail
/// with `TreePoolExhausted` once full).
pub struct Engine {
    config: EngineConfig,
    segalloc: Arc<dyn SegAlloc>,
    cache: NodeCache,
    slots: Mutex<Vec<Option<Arc<TreeDescriptor>>>>,
}

impl Engine {
    pub fn new(segalloc: Arc<dyn SegAlloc>, config: EngineConfig) -> Self {
        let slots = (0..config.tree_slots).map(|_| None).collect();
        Engine { cache: NodeCache::new(segalloc.clone()), config, segalloc, slots: Mutex::new(slots) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Evicts up to `count` unreferenced LRU descriptors (spec.md §4.5
    /// `lru_purge`), e.g. called by a caller-driven watchdog when resident
    /// count exceeds `lru_high_watermark`.
    pub fn lru_purge(&self, count: usize) -> usize {
        self.cache.lru_purge(count)
    }

    fn claim_slot(&self, tree: Arc<TreeDescriptor>) -> Result<usize> {
        let mut slots = self.slots.lock();
        let idx = slots.iter().position(Option::is_none).ok_or_else(|| Error::from(ErrorKind::TreePoolExhausted))?;
        slots[idx] = Some(tree);
        Ok(idx)
    }

    fn release_slot(&self, slot: usize) {
        self.slots.lock()[slot] = None;
    }

    /// Allocates a brand-new root node and registers a tree-descriptor slot
    /// for it (spec.md §4.4 `create`).
    pub fn create_tree(
        &self,
        tree_type: u32,
        shift: u8,
        ksize: u16,
        vsize: u16,
        tx: &dyn Tx,
    ) -> Result<TreeHandle<'_>> {
        {
            let slots = self.slots.lock();
            if slots.iter().all(Option::is_some) {
                return Err(Error::from(ErrorKind::TreePoolExhausted));
            }
        }

        let format: Arc<dyn NodeFormat> = resolve_format(FIXED_FORMAT_TYPE_ID)?;
        let addr = self.segalloc.alloc(shift, tx)?;
        let segment = self.segalloc.get(addr)?;
        format.init(segment.as_ref(), shift, ksize, vsize, tree_type, tx)?;

        // tree_slot is filled in once `claim_slot` hands back a real index;
        // the root lives directly on the tree descriptor and is never
        // indexed by `NodeCache`, since its address never changes for the
        // tree's lifetime (spec.md §4.4: "the root is pinned").
        let root_nd = Arc::new(NodeDescriptor::new_active(addr, segment, format, 0));
        let tree = Arc::new(TreeDescriptor::new(0, tree_type, root_nd.clone()));
        let slot = self.claim_slot(tree.clone())?;
        tree.set_slot(slot);
        root_nd.set_tree_slot(Some(slot));

        info!("engine: created tree slot={slot} root={:?}", addr);
        Ok(TreeHandle { engine: self, tree })
    }

    /// Re-opens a tree whose root address is already known (spec.md §4.4
    /// `open`). A B+-tree's height equals its root's persisted level plus
    /// one, so no leftmost-spine walk is needed to recover it.
    pub fn open_tree(&self, root_addr: SegAddr, tree_type: u32, tx: &dyn Tx) -> Result<TreeHandle<'_>> {
        let _ = tx;
        {
            let slots = self.slots.lock();
            if slots.iter().all(Option::is_some) {
                return Err(Error::from(ErrorKind::TreePoolExhausted));
            }
        }

        let segment = self.segalloc.get(root_addr)?;
        let type_id = crate::node::peek_node_type_id(segment.as_ref());
        let format = resolve_format(type_id)?;
        if !format.verify(segment.as_ref()) {
            warn!("engine: root at {:?} failed verify on open", root_addr);
            return Err(Error::from(ErrorKind::DataFault(root_addr)));
        }

        let level = format.level(segment.as_ref());
        let root_nd = Arc::new(NodeDescriptor::new_active(root_addr, segment, format, 0));
        let tree = Arc::new(TreeDescriptor::new(0, tree_type, root_nd.clone()));
        tree.set_height(level as u32 + 1);
        let slot = self.claim_slot(tree.clone())?;
        tree.set_slot(slot);
        root_nd.set_tree_slot(Some(slot));

        info!("engine: opened tree slot={slot} root={:?} height={}", root_addr, tree.height());
        Ok(TreeHandle { engine: self, tree })
    }
}

/// Public façade over one open tree (spec.md §4.6: `get`/`put`/`del`/
/// `iter`). Each call builds and runs one [`OpStateMachine`].
pub struct TreeHandle<'e> {
    engine: &'e Engine,
    tree: Arc<TreeDescriptor>,
}

impl<'e> TreeHandle<'e> {
    pub fn root_addr(&self) -> SegAddr {
        self.tree.root().addr
    }

    pub fn height(&self) -> u32 {
        self.tree.height()
    }

    fn run_op(
        &self,
        opcode: Opcode,
        flags: OpFlags,
        key: Vec<u8>,
        record: Option<Record>,
        cookie: Option<Cookie>,
        tx: &dyn Tx,
        callback: &mut dyn FnMut(ActFlag, ActSlot<'_>) -> std::result::Result<(), crate::error::CallbackError>,
    ) -> Result<Option<Cookie>> {
        let mut op =
            OpStateMachine::new(&self.engine.cache, self.tree.clone(), tx, opcode, flags, key, record, cookie, callback);
        let outcome = op.run()?;
        Ok(outcome.cookie)
    }

    /// Exact-match lookup (spec.md §6 `EQUAL`).
    pub fn get(&self, key: &[u8], tx: &dyn Tx) -> Result<Record> {
        let (cookie, record) = self.get_cookie(key, None, tx)?;
        let _ = cookie;
        Ok(record)
    }

    /// Exact-match lookup, accepting/returning a [`Cookie`] for the fast
    /// path (spec.md §4.6.1 COOKIE).
    pub fn get_cookie(&self, key: &[u8], cookie: Option<Cookie>, tx: &dyn Tx) -> Result<(Option<Cookie>, Record)> {
        if key.is_empty() {
            return Err(Error::from(ErrorKind::EmptyKey));
        }
        let mut result: Option<Record> = None;
        let mut triggered = false;
        let mut callback = |flag: ActFlag, slot: ActSlot<'_>| match flag {
            ActFlag::Success => {
                triggered = true;
                result = Some(slot.record());
                Ok(())
            }
            _ => {
                triggered = true;
                Err(crate::error::CallbackError::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "key not found",
                )))
            }
        };
        let flags = OpFlags { cookie: cookie.is_some(), lockall: false, slant: false };
        match self.run_op(Opcode::Lookup, flags, key.to_vec(), None, cookie, tx, &mut callback) {
            Ok(out_cookie) => {
                let record = result.ok_or_else(|| Error::from(ErrorKind::KeyNotFound))?;
                Ok((out_cookie, record))
            }
            Err(e) => {
                if triggered {
                    Err(Error::from(ErrorKind::KeyNotFound))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Inserts a new key/value pair (spec.md §4.6.1 ACT insert semantics:
    /// fails with `KeyExists` rather than overwriting).
    pub fn put(&self, key: &[u8], value: &[u8], tx: &dyn Tx) -> Result<()> {
        if key.is_empty() {
            return Err(Error::from(ErrorKind::EmptyKey));
        }
        let mut triggered = false;
        let mut outcome: Result<()> = Ok(());
        let mut callback = |flag: ActFlag, _slot: ActSlot<'_>| match flag {
            ActFlag::Success => {
                triggered = true;
                outcome = Ok(());
                Ok(())
            }
            ActFlag::KeyExists => {
                triggered = true;
                outcome = Err(Error::from(ErrorKind::KeyExists));
                Err(crate::error::CallbackError::new(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "key exists",
                )))
            }
            _ => unreachable!("insert ACT only ever reports Success or KeyExists"),
        };
        let flags = OpFlags::default();
        let record = Record { key: key.to_vec(), value: value.to_vec() };
        match self.run_op(Opcode::Insert, flags, key.to_vec(), Some(record), None, tx, &mut callback) {
            Ok(_) => outcome,
            Err(e) => {
                if triggered {
                    outcome
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Removes a key (spec.md §4.6.1 ACT delete semantics, including
    /// underflow resolution up to root collapse).
    pub fn del(&self, key: &[u8], tx: &dyn Tx) -> Result<()> {
        if key.is_empty() {
            return Err(Error::from(ErrorKind::EmptyKey));
        }
        let mut triggered = false;
        let mut outcome: Result<()> = Ok(());
        let mut callback = |flag: ActFlag, _slot: ActSlot<'_>| match flag {
            ActFlag::Success => {
                triggered = true;
                outcome = Ok(());
                Ok(())
            }
            ActFlag::KeyNotFound => {
                triggered = true;
                outcome = Err(Error::from(ErrorKind::KeyNotFound));
                Err(crate::error::CallbackError::new(std::io::Error::new(std::io::ErrorKind::NotFound, "key not found")))
            }
            _ => unreachable!("delete ACT only ever reports Success or KeyNotFound"),
        };
        let flags = OpFlags::default();
        match self.run_op(Opcode::Delete, flags, key.to_vec(), None, None, tx, &mut callback) {
            Ok(_) => outcome,
            Err(e) => {
                if triggered {
                    outcome
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Finds the first record with key `>= key` (`NEXT`) or `<= key`
    /// (`PREV`) (spec.md §6). Returns `Boundary` past either end.
    pub fn iter(&self, key: &[u8], direction: IterDirection, tx: &dyn Tx) -> Result<Record> {
        let mut result: Option<Record> = None;
        let mut triggered = false;
        let mut callback = |flag: ActFlag, slot: ActSlot<'_>| match flag {
            ActFlag::Success => {
                triggered = true;
                result = Some(slot.record());
                Ok(())
            }
            ActFlag::KeyBoundary => {
                triggered = true;
                Err(crate::error::CallbackError::new(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "iteration boundary",
                )))
            }
            _ => unreachable!("iterate ACT only ever reports Success or KeyBoundary"),
        };
        let flags = OpFlags::default();
        match self.run_op(Opcode::Iterate(direction), flags, key.to_vec(), None, None, tx, &mut callback) {
            Ok(_) => result.ok_or_else(|| Error::from(ErrorKind::Boundary)),
            Err(e) => {
                if triggered {
                    Err(Error::from(ErrorKind::Boundary))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Waits for this tree's active-node list to drain to just the root,
    /// then releases its slot (spec.md §5 "`close` waits up to 5 seconds").
    pub fn close(self, _tx: &dyn Tx) -> Result<()> {
        let deadline = Instant::now() + self.engine.config.close_drain_timeout;
        loop {
            if self.tree.active_count() <= 1 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("engine: close timed out draining tree slot={}", self.tree.slot());
                return Err(Error::from(ErrorKind::Timeout));
            }
            std::thread::yield_now();
        }
        self.engine.release_slot(self.tree.slot());
        trace!("engine: closed tree slot={} after {:?}", self.tree.slot(), self.tree.elapsed_since_open());
        Ok(())
    }

    /// Releases the root allocation and the tree's slot. Fails with
    /// `NotEmpty` unless the root is empty (spec.md §4.4 `destroy`).
    pub fn destroy(self, tx: &dyn Tx) -> Result<()> {
        let root = self.tree.root();
        if root.format.count(root.segment.as_ref()) > 0 {
            return Err(Error::from(ErrorKind::NotEmpty));
        }
        root.format.fini(root.segment.as_ref(), tx)?;
        self.engine.segalloc.free(root.addr, tx)?;
        self.engine.release_slot(self.tree.slot());
        info!("engine: destroyed tree slot={}", self.tree.slot());
        Ok(())
    }
}
