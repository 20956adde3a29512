//! [`OpStateMachine`] — the restartable state machine driving lookup,
//! insert, delete, and iterate (spec.md §4.6).
//!
//! The state enum below names every state in spec.md's transition diagram
//! and every transition is traced at `log::trace!`, matching SPEC_FULL.md
//! §4.6a. The *driver*, however, is [`OpStateMachine::run`]: a single
//! synchronous call rather than a `step()` an external scheduler re-enters.
//! Spec.md §5 explicitly allows this ("single-threaded cooperative
//! execution is also valid... when no I/O is outstanding"), and it is the
//! only execution model this crate's opaque `Segment`/`SegAlloc`
//! collaborators can ever actually need: both are synchronous traits with
//! no suspension point, so a re-entrant `step()` would never yield in
//! practice. Holding the tree lock as an ordinary Rust local across
//! LOCKALL..CLEANUP is sound under this model and avoids the
//! self-referential-guard plumbing a truly re-entrant state machine would
//! require for no behavioral benefit here.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::{trace, warn};
use parking_lot::RwLockWriteGuard;

use crate::cache::NodeCache;
use crate::cookie::Cookie;
use crate::descriptor::NodeDescriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::node::format::{Direction, MoveCount, NodeFormat, Record, Slot};
use crate::segalloc::Tx;
use crate::tree_descriptor::TreeDescriptor;

/// Number of optimistic trials, and separately of escalated lock-all
/// trials, before an operation fails with `TooManyRestarts` (SPEC_FULL.md
/// §3, confirmed against `btree.c`'s `MAX_TRIALS`).
const MAX_TRIALS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Cookie,
    Setup,
    LockAll,
    Down,
    Alloc,
    Sibling,
    StoreChild,
    Lock,
    Check,
    Act,
    MakeSpace,
    FreeNode,
    Cleanup,
    Fini,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterDirection {
    Next,
    Prev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Lookup,
    Insert,
    Delete,
    Iterate(IterDirection),
}

/// Flags accepted on a call (spec.md §6): `EQUAL` is the default lookup
/// mode; `NEXT`/`PREV` are folded into [`Opcode::Iterate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpFlags {
    pub cookie: bool,
    pub lockall: bool,
    pub slant: bool,
}

/// Delivered to the caller's callback alongside the slot it was invoked
/// with (spec.md §6 "Flags on callback record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActFlag {
    Success,
    KeyExists,
    KeyNotFound,
    KeyBoundary,
}

/// A read-only view of the slot the callback is being invoked with.
pub struct ActSlot<'a> {
    nd: &'a Arc<NodeDescriptor>,
    pub idx: usize,
}

impl<'a> ActSlot<'a> {
    pub fn record(&self) -> Record {
        self.nd.format.rec(self.nd.segment.as_ref(), Slot { idx: self.idx })
    }

    pub fn key(&self) -> Vec<u8> {
        self.nd.format.key(self.nd.segment.as_ref(), Slot { idx: self.idx })
    }
}

/// The caller-supplied callback (spec.md §6 "Callback protocol"): invoked
/// synchronously inside ACT; returning `Err` requests undo.
pub type ActCallback<'a> =
    &'a mut dyn FnMut(ActFlag, ActSlot<'_>) -> std::result::Result<(), crate::error::CallbackError>;

pub struct OpOutcome {
    pub cookie: Option<Cookie>,
}

struct LevelEntry {
    node: Arc<NodeDescriptor>,
    seq_snapshot: u64,
    /// Insertion point / match index at this level (used directly for
    /// ACT at the leaf).
    find_idx: usize,
    find_exact: bool,
    /// Index of the child we followed from this level, if any (absent at
    /// the leaf). Doubles as the index to remove when the child is freed
    /// during underflow resolution.
    child_idx: Option<usize>,
}

/// Restartable state machine for one `get`/`put`/`del`/`iter` call
/// (spec.md §4.6).
pub struct OpStateMachine<'a> {
    cache: &'a NodeCache,
    tree: Arc<TreeDescriptor>,
    tx: &'a dyn Tx,
    opcode: Opcode,
    flags: OpFlags,
    key: Vec<u8>,
    record: Option<Record>,
    cookie: Option<Cookie>,
    callback: ActCallback<'a>,

    state: State,
    levels: Vec<LevelEntry>,
    sib_levels: Vec<LevelEntry>,
    pivot_level: Option<usize>,
    l_alloc: Vec<Option<Arc<NodeDescriptor>>>,
    i_extra_node: Option<Arc<NodeDescriptor>>,
    store_child: Option<Arc<NodeDescriptor>>,
    freenode_queue: Vec<Arc<NodeDescriptor>>,
    height_snapshot: u32,
    trial: u32,
    lockall_trial: u32,
    lockall: bool,
}

impl<'a> OpStateMachine<'a> {
    pub fn new(
        cache: &'a NodeCache,
        tree: Arc<TreeDescriptor>,
        tx: &'a dyn Tx,
        opcode: Opcode,
        flags: OpFlags,
        key: Vec<u8>,
        record: Option<Record>,
        cookie: Option<Cookie>,
        callback: ActCallback<'a>,
    ) -> Self {
        let lockall = flags.lockall;
        OpStateMachine {
            cache,
            tree,
            tx,
            opcode,
            flags,
            key,
            record,
            cookie,
            callback,
            state: State::Init,
            levels: Vec::new(),
            sib_levels: Vec::new(),
            pivot_level: None,
            l_alloc: Vec::new(),
            i_extra_node: None,
            store_child: None,
            freenode_queue: Vec::new(),
            height_snapshot: 0,
            trial: 0,
            lockall_trial: 0,
            lockall,
        }
    }

    fn trace_state(&self, s: State) {
        trace!("op: -> {:?} (opcode={:?})", s, self.opcode);
    }

    /// Drives the state machine to completion.
    pub fn run(&mut self) -> Result<OpOutcome> {
        self.trace_state(State::Init);
        self.state = State::Init;

        // INIT -> (COOKIE | SETUP)
        if self.flags.cookie && self.cookie.is_some() {
            self.state = State::Cookie;
            self.trace_state(State::Cookie);
            if self.try_cookie_fast_path()? {
                let outcome = self.finish_success_cookie();
                return Ok(outcome);
            }
        }

        let mut tree_guard: Option<RwLockWriteGuard<'_, ()>> = None;

        loop {
            self.state = State::Setup;
            self.trace_state(State::Setup);
            self.height_snapshot = self.tree.height();
            self.levels.clear();
            self.sib_levels.clear();
            self.pivot_level = None;

            if self.lockall && tree_guard.is_none() {
                self.state = State::LockAll;
                self.trace_state(State::LockAll);
                tree_guard = Some(self.tree.lock());
            }

            self.state = State::Down;
            self.trace_state(State::Down);
            if let Err(e) = self.descend() {
                self.cleanup()?;
                self.state = State::Fini;
                return Err(e);
            }

            if matches!(self.opcode, Opcode::Iterate(_)) {
                let leaf_ok = self.leaf_satisfies_iterate();
                if !leaf_ok {
                    if let Some(pivot) = self.pivot_level {
                        self.state = State::Sibling;
                        self.trace_state(State::Sibling);
                        if let Err(e) = self.descend_sibling(pivot) {
                            self.cleanup()?;
                            self.state = State::Fini;
                            return Err(e);
                        }
                    }
                }
            }

            if matches!(self.opcode, Opcode::Insert) {
                self.state = State::Alloc;
                self.trace_state(State::Alloc);
                if let Err(e) = self.alloc_spares() {
                    self.cleanup()?;
                    self.state = State::Fini;
                    return Err(e);
                }
            }

            // Only relevant when the root is an internal node (i.e. the
            // descent recorded more than just the root/leaf itself) — a
            // leaf-root's `count` is a data-record count, not a child
            // count, and must never be fed to `load_root_sibling`.
            if matches!(self.opcode, Opcode::Delete) && self.levels.len() > 1 {
                let root_entry = &self.levels[0];
                if root_entry.node.format.count(root_entry.node.segment.as_ref()) == 2 {
                    self.state = State::StoreChild;
                    self.trace_state(State::StoreChild);
                    if let Err(e) = self.load_root_sibling() {
                        self.cleanup()?;
                        self.state = State::Fini;
                        return Err(e);
                    }
                }
            }

            if tree_guard.is_none() {
                self.state = State::Lock;
                self.trace_state(State::Lock);
                tree_guard = Some(self.tree.lock());
            }

            self.state = State::Check;
            self.trace_state(State::Check);
            match self.check() {
                CheckOutcome::Ok => {}
                CheckOutcome::RestartDown => {
                    tree_guard = None;
                    self.release_levels()?;
                    continue;
                }
                CheckOutcome::RestartSetup => {
                    tree_guard = None;
                    self.release_levels()?;
                    continue;
                }
                CheckOutcome::EscalateLockAll => {
                    self.lockall = true;
                    tree_guard = None;
                    self.release_levels()?;
                    continue;
                }
                CheckOutcome::TooManyRestarts => {
                    self.release_levels()?;
                    self.cleanup()?;
                    self.state = State::Fini;
                    warn!("op: too many restarts for opcode={:?}", self.opcode);
                    return Err(Error::from(ErrorKind::TooManyRestarts));
                }
            }

            self.state = State::Act;
            self.trace_state(State::Act);
            let act_result = self.act();
            let next = match act_result {
                Ok(next) => next,
                Err(e) => {
                    drop(tree_guard.take());
                    self.cleanup()?;
                    self.state = State::Fini;
                    return Err(e);
                }
            };

            let mut state = next;
            loop {
                match state {
                    State::MakeSpace => {
                        self.state = State::MakeSpace;
                        self.trace_state(State::MakeSpace);
                        match self.makespace() {
                            Ok(n) => state = n,
                            Err(e) => {
                                drop(tree_guard.take());
                                self.cleanup()?;
                                self.state = State::Fini;
                                return Err(e);
                            }
                        }
                    }
                    State::FreeNode => {
                        self.state = State::FreeNode;
                        self.trace_state(State::FreeNode);
                        if let Err(e) = self.free_queued_nodes() {
                            drop(tree_guard.take());
                            self.cleanup()?;
                            self.state = State::Fini;
                            return Err(e);
                        }
                        state = State::Cleanup;
                    }
                    State::Cleanup => break,
                    _ => unreachable!("act()/makespace() only ever returns MakeSpace/FreeNode/Cleanup"),
                }
            }

            self.state = State::Cleanup;
            self.trace_state(State::Cleanup);
            drop(tree_guard.take());
            self.cleanup()?;
            self.state = State::Fini;
            self.trace_state(State::Fini);
            self.state = State::Done;
            let cookie = self.result_cookie();
            return Ok(OpOutcome { cookie });
        }
    }

    fn result_cookie(&self) -> Option<Cookie> {
        if matches!(self.opcode, Opcode::Iterate(_)) {
            return None;
        }
        self.levels.last().map(|l| Cookie::new(l.node.addr, l.node.seq()))
    }

    fn finish_success_cookie(&mut self) -> OpOutcome {
        self.state = State::Done;
        OpOutcome { cookie: self.levels.last().map(|l| Cookie::new(l.node.addr, l.node.seq())) }
    }

    /// COOKIE: if the cookie still refers to a live leaf bounding the
    /// target key, validate it with the usual CHECK machinery and act on
    /// it directly. Never the only source of correctness — a miss simply
    /// falls through to SETUP.
    fn try_cookie_fast_path(&mut self) -> Result<bool> {
        let cookie = match self.cookie {
            Some(c) => c,
            None => return Ok(false),
        };
        let nd = match self.cache.get(&self.tree, cookie.leaf_addr) {
            Ok(nd) => nd,
            Err(_) => return Ok(false),
        };
        if !nd.format.is_valid(nd.segment.as_ref()) || !cookie.still_valid(nd.seq()) {
            self.cache.put(&self.tree, &nd, self.tx)?;
            return Ok(false);
        }
        let r = nd.format.find(nd.segment.as_ref(), &self.key);
        let bounds_key = nd.format.count(nd.segment.as_ref()) > 0;
        if !bounds_key {
            self.cache.put(&self.tree, &nd, self.tx)?;
            return Ok(false);
        }
        let fits_op = match self.opcode {
            Opcode::Insert => nd.format.is_fit(nd.segment.as_ref(), 1),
            Opcode::Delete => !nd.format.is_underflow(nd.segment.as_ref(), true),
            _ => true,
        };
        if !fits_op {
            self.cache.put(&self.tree, &nd, self.tx)?;
            return Ok(false);
        }

        self.levels.push(LevelEntry {
            node: nd.clone(),
            seq_snapshot: nd.seq(),
            find_idx: r.idx,
            find_exact: r.exact,
            child_idx: None,
        });

        let _guard = self.tree.lock();
        let act_result = self.act();
        // Any failure here — including a callback-reported KeyNotFound/
        // KeyExists/Boundary — falls back to a full descent rather than
        // propagating: `bounds_key` above only checks the leaf is
        // non-empty, not that it actually bounds `self.key`, so a
        // "declined" ACT on the cookie's leaf does not prove the key is
        // truly absent from the tree. Spec.md §9: "correctness must not
        // depend on [the cookie's] acceptance path."
        let next = match act_result {
            Ok(next) => next,
            Err(_) => {
                self.release_levels()?;
                return Ok(false);
            }
        };
        match next {
            State::Cleanup => {
                self.release_levels()?;
                Ok(true)
            }
            _ => {
                // A cookie-guided op that needs MAKESPACE/FREENODE falls
                // through to full descent rather than replicate that
                // machinery on a single borrowed level.
                self.release_levels()?;
                Ok(false)
            }
        }
    }

    fn release_levels(&mut self) -> Result<()> {
        for entry in self.levels.drain(..) {
            self.cache.put(&self.tree, &entry.node, self.tx)?;
        }
        for entry in self.sib_levels.drain(..) {
            self.cache.put(&self.tree, &entry.node, self.tx)?;
        }
        if let Some(nd) = self.store_child.take() {
            self.cache.put(&self.tree, &nd, self.tx)?;
        }
        Ok(())
    }

    fn descend(&mut self) -> Result<()> {
        // The root is handed out pinned (`ref_count = 1` from
        // `create`/`open_tree`, never indexed by `NodeCache`) rather than
        // through `cache.get`, which is the only other place that
        // increments a descriptor's refcount. Since this entry is about to
        // be pushed into `self.levels` and released like any other
        // descended node (`release_levels` -> `cache.put` -> `decref`),
        // take a matching temporary reference here so the permanent pin
        // survives the operation instead of being consumed by it.
        let mut current = self.tree.root_ref();
        loop {
            let seq_snapshot = current.seq();
            let seg = current.segment.as_ref();
            let r = current.format.find(seg, &self.key);
            let level = current.format.level(seg);

            if level == 0 {
                self.levels.push(LevelEntry {
                    node: current,
                    seq_snapshot,
                    find_idx: r.idx,
                    find_exact: r.exact,
                    child_idx: None,
                });
                return Ok(());
            }

            if matches!(self.opcode, Opcode::Iterate(_)) {
                self.record_pivot_candidate(current.format.count(seg), r.idx, r.exact);
            }

            let child_idx = if r.exact { r.idx + 1 } else { r.idx };
            let child_addr = current.format.child(seg, Slot { idx: child_idx })?;
            if !child_addr.is_valid() {
                warn!("op: child pointer {:?} failed validity check during descent", child_addr);
                return Err(Error::from(ErrorKind::DataFault(child_addr)));
            }

            self.levels.push(LevelEntry {
                node: current.clone(),
                seq_snapshot,
                find_idx: r.idx,
                find_exact: r.exact,
                child_idx: Some(child_idx),
            });

            current = self.cache.get(&self.tree, child_addr)?;
        }
    }

    fn record_pivot_candidate(&mut self, count: usize, idx: usize, exact: bool) {
        let child_idx = if exact { idx + 1 } else { idx };
        let has_sibling = match self.opcode {
            Opcode::Iterate(IterDirection::Next) => child_idx + 1 < count,
            Opcode::Iterate(IterDirection::Prev) => child_idx > 0,
            _ => false,
        };
        if has_sibling {
            self.pivot_level = Some(self.levels.len());
        }
    }

    fn leaf_satisfies_iterate(&self) -> bool {
        let leaf = self.levels.last().expect("descent always reaches a leaf");
        let count = leaf.node.format.count(leaf.node.segment.as_ref());
        match self.opcode {
            Opcode::Iterate(IterDirection::Next) => leaf.find_idx < count,
            Opcode::Iterate(IterDirection::Prev) => {
                if leaf.find_exact {
                    true
                } else {
                    leaf.find_idx > 0
                }
            }
            _ => true,
        }
    }

    fn descend_sibling(&mut self, pivot: usize) -> Result<()> {
        let pivot_entry = &self.levels[pivot];
        let seg = pivot_entry.node.segment.as_ref();
        let r_idx = pivot_entry.find_idx;
        let exact = pivot_entry.find_exact;
        let taken_child = if exact { r_idx + 1 } else { r_idx };

        let sib_child_idx = match self.opcode {
            Opcode::Iterate(IterDirection::Next) => taken_child + 1,
            Opcode::Iterate(IterDirection::Prev) => taken_child - 1,
            _ => unreachable!(),
        };
        let mut addr = pivot_entry.node.format.child(seg, Slot { idx: sib_child_idx })?;

        loop {
            let nd = self.cache.get(&self.tree, addr)?;
            let seq_snapshot = nd.seq();
            let level = nd.format.level(nd.segment.as_ref());
            let count = nd.format.count(nd.segment.as_ref());

            if level == 0 {
                let idx = match self.opcode {
                    Opcode::Iterate(IterDirection::Next) => 0,
                    Opcode::Iterate(IterDirection::Prev) => count.saturating_sub(1),
                    _ => unreachable!(),
                };
                self.sib_levels.push(LevelEntry {
                    node: nd,
                    seq_snapshot,
                    find_idx: idx,
                    find_exact: true,
                    child_idx: None,
                });
                return Ok(());
            }

            let child_idx = match self.opcode {
                Opcode::Iterate(IterDirection::Next) => 0,
                Opcode::Iterate(IterDirection::Prev) => count - 1,
                _ => unreachable!(),
            };
            addr = nd.format.child(nd.segment.as_ref(), Slot { idx: child_idx })?;
            self.sib_levels.push(LevelEntry {
                node: nd,
                seq_snapshot,
                find_idx: child_idx,
                find_exact: false,
                child_idx: Some(child_idx),
            });
        }
    }

    fn alloc_spares(&mut self) -> Result<()> {
        self.l_alloc = Vec::with_capacity(self.levels.len());
        for entry in &self.levels {
            let seg = entry.node.segment.as_ref();
            let shift = entry.node.format.shift(seg);
            let ksize = entry.node.format.keysize(seg);
            let vsize = entry.node.format.valsize(seg);
            let spare = self.cache.alloc(&self.tree, shift, entry.node.format.clone(), ksize, vsize, self.tx)?;
            self.l_alloc.push(Some(spare));
        }
        let root = &self.levels[0].node;
        let seg = root.segment.as_ref();
        let extra = self.cache.alloc(
            &self.tree,
            root.format.shift(seg),
            root.format.clone(),
            root.format.keysize(seg),
            root.format.valsize(seg),
            self.tx,
        )?;
        self.i_extra_node = Some(extra);
        Ok(())
    }

    fn load_root_sibling(&mut self) -> Result<()> {
        let root_entry = &self.levels[0];
        let taken = root_entry.child_idx.unwrap_or(0);
        let other = 1 - taken;
        let addr = root_entry.node.format.child(root_entry.node.segment.as_ref(), Slot { idx: other })?;
        self.store_child = Some(self.cache.get(&self.tree, addr)?);
        Ok(())
    }

    fn check(&mut self) -> CheckOutcome {
        if self.tree.height() != self.height_snapshot {
            return CheckOutcome::RestartSetup;
        }

        let mut all_levels = self.levels.iter().chain(self.sib_levels.iter());
        let ok = all_levels.all(|e| {
            e.node.format.is_valid(e.node.segment.as_ref()) && e.node.seq() == e.seq_snapshot
        });

        if ok {
            return CheckOutcome::Ok;
        }

        if self.lockall {
            self.lockall_trial += 1;
            if self.lockall_trial >= MAX_TRIALS {
                CheckOutcome::TooManyRestarts
            } else {
                CheckOutcome::RestartDown
            }
        } else {
            self.trial += 1;
            if self.trial >= MAX_TRIALS {
                CheckOutcome::EscalateLockAll
            } else {
                CheckOutcome::RestartDown
            }
        }
    }

    fn act(&mut self) -> Result<State> {
        match self.opcode {
            Opcode::Lookup => self.act_lookup(),
            Opcode::Iterate(_) => self.act_iterate(),
            Opcode::Insert => self.act_insert(),
            Opcode::Delete => self.act_delete(),
        }
    }

    fn act_lookup(&mut self) -> Result<State> {
        let entry = self.levels.last().expect("leaf always present");
        let nd = entry.node.clone();
        if entry.find_exact || self.flags.slant {
            let idx = if entry.find_exact {
                entry.find_idx
            } else if entry.find_idx < nd.format.count(nd.segment.as_ref()) {
                entry.find_idx
            } else {
                return self.invoke_callback(ActFlag::KeyNotFound, &nd, entry.find_idx);
            };
            self.invoke_callback(ActFlag::Success, &nd, idx)
        } else {
            self.invoke_callback(ActFlag::KeyNotFound, &nd, entry.find_idx)
        }
    }

    fn act_iterate(&mut self) -> Result<State> {
        if self.leaf_satisfies_iterate() {
            let entry = self.levels.last().expect("leaf always present");
            let nd = entry.node.clone();
            let idx = match self.opcode {
                Opcode::Iterate(IterDirection::Next) => entry.find_idx,
                Opcode::Iterate(IterDirection::Prev) => {
                    if entry.find_exact {
                        entry.find_idx
                    } else {
                        entry.find_idx - 1
                    }
                }
                _ => unreachable!(),
            };
            self.invoke_callback(ActFlag::Success, &nd, idx)
        } else if let Some(sib) = self.sib_levels.last() {
            let nd = sib.node.clone();
            let idx = sib.find_idx;
            self.invoke_callback(ActFlag::Success, &nd, idx)
        } else {
            let entry = self.levels.last().expect("leaf always present");
            let nd = entry.node.clone();
            self.invoke_callback(ActFlag::KeyBoundary, &nd, entry.find_idx)
        }
    }

    fn act_insert(&mut self) -> Result<State> {
        let entry = self.levels.last().expect("leaf always present");
        if entry.find_exact {
            let nd = entry.node.clone();
            let idx = entry.find_idx;
            return self.invoke_callback(ActFlag::KeyExists, &nd, idx);
        }
        let nd = entry.node.clone();
        let idx = entry.find_idx;
        let rec = self.record.clone().expect("insert always carries a record");

        if !nd.format.is_fit(nd.segment.as_ref(), 1) {
            return Ok(State::MakeSpace);
        }

        let seg = nd.segment.as_ref();
        nd.format.make(seg, Slot { idx }, self.tx)?;
        nd.format.write_record(seg, Slot { idx }, &rec, self.tx)?;
        nd.touch();

        match self.invoke_callback(ActFlag::Success, &nd, idx) {
            Ok(next) => {
                nd.format.fix(seg, self.tx)?;
                Ok(next)
            }
            Err(e) => {
                nd.format.del(seg, Slot { idx }, self.tx)?;
                nd.format.fix(seg, self.tx)?;
                nd.touch();
                Err(e)
            }
        }
    }

    fn act_delete(&mut self) -> Result<State> {
        let entry = self.levels.last().expect("leaf always present");
        if !entry.find_exact {
            let nd = entry.node.clone();
            let idx = entry.find_idx;
            return self.invoke_callback(ActFlag::KeyNotFound, &nd, idx);
        }
        let nd = entry.node.clone();
        let idx = entry.find_idx;
        let seg = nd.segment.as_ref();

        nd.format.del(seg, Slot { idx }, self.tx)?;
        nd.format.fix(seg, self.tx)?;
        nd.touch();

        // Unlike insert (spec.md §4.6.2: undo `del` + re-`move` on
        // callback failure), the original deletes first and only then
        // invokes the callback; a nonzero return there aborts the
        // operation without undoing the already-completed deletion
        // (`fail()` just jumps to cleanup). `idx` no longer names the
        // deleted record by the time the callback runs, only the
        // position it occupied — callers must not rely on `ActSlot`
        // contents for a delete's `Success` flag.
        self.invoke_callback(ActFlag::Success, &nd, idx)?;

        if !nd.format.is_underflow(seg, false) {
            return Ok(State::Cleanup);
        }
        self.resolve_underflow()
    }

    fn invoke_callback(&mut self, flag: ActFlag, nd: &Arc<NodeDescriptor>, idx: usize) -> Result<State> {
        (self.callback)(flag, ActSlot { nd, idx }).map_err(Error::from)?;
        Ok(State::Cleanup)
    }

    fn makespace(&mut self) -> Result<State> {
        let mut pending = self.record.clone().expect("makespace only runs for insert");
        let mut level_idx = self.levels.len() - 1;
        let leaf_level = level_idx;

        loop {
            let nd = self.levels[level_idx].node.clone();
            let seg = nd.segment.as_ref();
            let fmt = nd.format.clone();

            if fmt.is_fit(seg, 1) {
                let idx = fmt.find(seg, &pending.key).idx;
                fmt.make(seg, Slot { idx }, self.tx)?;
                fmt.write_record(seg, Slot { idx }, &pending, self.tx)?;
                nd.touch();

                if level_idx == leaf_level {
                    return match self.invoke_callback(ActFlag::Success, &nd, idx) {
                        Ok(_) => {
                            fmt.fix(seg, self.tx)?;
                            Ok(State::Cleanup)
                        }
                        Err(e) => {
                            fmt.del(seg, Slot { idx }, self.tx)?;
                            fmt.fix(seg, self.tx)?;
                            nd.touch();
                            Err(e)
                        }
                    };
                }
                fmt.fix(seg, self.tx)?;
                return Ok(State::Cleanup);
            }

            let l_alloc_nd = self.l_alloc[level_idx].take().ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?;
            l_alloc_nd.format.set_level(l_alloc_nd.segment.as_ref(), fmt.level(seg), self.tx)?;
            fmt.move_records(seg, l_alloc_nd.segment.as_ref(), Direction::Left, MoveCount::Even, self.tx)?;
            nd.touch();
            l_alloc_nd.touch();

            let right_first =
                if fmt.count(seg) > 0 { fmt.key(seg, Slot { idx: 0 }) } else { pending.key.clone() };
            let goes_left = pending.key.as_slice() < right_first.as_slice();
            let target = if goes_left { l_alloc_nd.clone() } else { nd.clone() };

            let tseg = target.segment.as_ref();
            let tfmt = target.format.clone();
            let idx = tfmt.find(tseg, &pending.key).idx;
            tfmt.make(tseg, Slot { idx }, self.tx)?;
            tfmt.write_record(tseg, Slot { idx }, &pending, self.tx)?;
            target.touch();

            if level_idx == leaf_level {
                let undo = |this: &mut Self| -> Result<()> {
                    tfmt.del(tseg, Slot { idx }, this.tx)?;
                    tfmt.fix(tseg, this.tx)?;
                    target.touch();
                    fmt.move_records(l_alloc_nd.segment.as_ref(), seg, Direction::Right, MoveCount::Max, this.tx)?;
                    nd.touch();
                    this.cache.free(&this.tree, &l_alloc_nd, this.tx)?;
                    Ok(())
                };
                match self.invoke_callback(ActFlag::Success, &target, idx) {
                    Ok(_) => {
                        tfmt.fix(tseg, self.tx)?;
                    }
                    Err(e) => {
                        undo(self)?;
                        return Err(e);
                    }
                }
            } else {
                tfmt.fix(tseg, self.tx)?;
            }

            let promoted_key = right_first;
            let mut value = vec![0u8; 8];
            BigEndian::write_u64(&mut value, l_alloc_nd.addr.raw());
            pending = Record { key: promoted_key, value };

            if level_idx == 0 {
                return self.split_root(l_alloc_nd, pending);
            }
            level_idx -= 1;
        }
    }

    fn split_root(&mut self, l_alloc_nd: Arc<NodeDescriptor>, pending: Record) -> Result<State> {
        let root_nd = self.tree.root();
        let extra_nd = self.i_extra_node.take().ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?;

        let root_seg = root_nd.segment.as_ref();
        let shift = root_nd.format.shift(root_seg);
        let old_level = root_nd.format.level(root_seg);
        let ksize = root_nd.format.keysize(root_seg);
        let vsize = root_nd.format.valsize(root_seg);

        let mut buf = vec![0u8; 1usize << shift];
        root_seg.read_at(0, &mut buf);
        extra_nd.segment.write_at(0, &buf);
        extra_nd.format.opaque_set(extra_nd.segment.as_ref(), extra_nd.addr.raw());
        extra_nd.touch();

        root_nd.format.init(root_seg, shift, ksize, vsize, self.tree.tree_type, self.tx)?;
        root_nd.format.set_level(root_seg, old_level + 1, self.tx)?;

        root_nd.format.make(root_seg, Slot { idx: 0 }, self.tx)?;
        let mut v1 = vec![0u8; 8];
        BigEndian::write_u64(&mut v1, l_alloc_nd.addr.raw());
        root_nd.format.write_record(root_seg, Slot { idx: 0 }, &Record { key: pending.key, value: v1 }, self.tx)?;

        root_nd.format.make(root_seg, Slot { idx: 1 }, self.tx)?;
        let mut v2 = vec![0u8; 8];
        BigEndian::write_u64(&mut v2, extra_nd.addr.raw());
        let sentinel = vec![0xFFu8; ksize as usize];
        root_nd.format.write_record(root_seg, Slot { idx: 1 }, &Record { key: sentinel, value: v2 }, self.tx)?;
        root_nd.format.fix(root_seg, self.tx)?;
        root_nd.touch();

        self.tree.incr_height();
        Ok(State::Cleanup)
    }

    fn resolve_underflow(&mut self) -> Result<State> {
        let mut level_idx = self.levels.len() - 1;
        loop {
            if level_idx == 0 {
                return self.collapse_root();
            }
            let child_nd = self.levels[level_idx].node.clone();
            let parent_idx = level_idx - 1;
            let parent_nd = self.levels[parent_idx].node.clone();
            let parent_seg = parent_nd.segment.as_ref();
            let del_idx = self.levels[parent_idx].child_idx.expect("non-leaf level always has child_idx");

            parent_nd.format.del(parent_seg, Slot { idx: del_idx }, self.tx)?;
            parent_nd.format.fix(parent_seg, self.tx)?;
            parent_nd.touch();

            self.freenode_queue.push(child_nd);

            if !parent_nd.format.is_underflow(parent_seg, false) {
                return Ok(State::FreeNode);
            }
            level_idx = parent_idx;
        }
    }

    fn collapse_root(&mut self) -> Result<State> {
        let root_nd = self.tree.root();
        let seg = root_nd.segment.as_ref();
        let used = root_nd.format.count(seg);

        if used > 1 {
            return Ok(State::FreeNode);
        }
        if used == 0 {
            if root_nd.format.level(seg) > 0 {
                root_nd.format.set_level(seg, 0, self.tx)?;
                root_nd.format.fix(seg, self.tx)?;
                root_nd.touch();
                self.tree.set_height(1);
            }
            return Ok(State::FreeNode);
        }

        let child_nd = self.store_child.take().ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?;
        let child_seg = child_nd.segment.as_ref();
        let new_level = root_nd.format.level(seg).saturating_sub(1);

        root_nd.format.del(seg, Slot { idx: 0 }, self.tx)?;
        root_nd.format.move_records(child_seg, seg, Direction::Left, MoveCount::Max, self.tx)?;
        root_nd.format.set_level(seg, new_level, self.tx)?;
        root_nd.format.fix(seg, self.tx)?;
        root_nd.touch();

        self.tree.decr_height();
        self.freenode_queue.push(child_nd);
        Ok(State::FreeNode)
    }

    fn free_queued_nodes(&mut self) -> Result<()> {
        for nd in self.freenode_queue.drain(..) {
            self.cache.free(&self.tree, &nd, self.tx)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.release_levels()?;
        if let Some(extra) = self.i_extra_node.take() {
            self.cache.free(&self.tree, &extra, self.tx)?;
        }
        for spare in self.l_alloc.drain(..).flatten() {
            self.cache.free(&self.tree, &spare, self.tx)?;
        }
        Ok(())
    }
}

enum CheckOutcome {
    Ok,
    RestartDown,
    RestartSetup,
    EscalateLockAll,
    TooManyRestarts,
}
