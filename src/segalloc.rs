//! External collaborator traits (spec.md §1): `Tx` and `SegAlloc`/`Segment`
//! are kept intentionally opaque — the engine only ever calls through them,
//! never inspects a concrete implementation. A small in-memory reference
//! implementation (`MemSegAlloc`/`MemSegment`) is provided for tests, built
//! the way the teacher's `worst_fit_list.rs` builds its bitmap allocator.

use bitvec::prelude::*;
use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::segaddr::SegAddr;

/// A transaction handle. The engine treats this as opaque: it groups a set
/// of node writes for the collaborator's own crash-consistency guarantees
/// (spec.md §1, "Non-goal: crash consistency beyond what `Tx` already
/// provides").
pub trait Tx: Send + Sync {
    /// Marks `addr` as written within this transaction.
    fn note_write(&self, addr: SegAddr);
    /// Commits the transaction. No-op for reference implementations.
    fn commit(&self) -> Result<()>;
}

/// A `Tx` that performs no bookkeeping, for tests that don't care about
/// transactional grouping.
#[derive(Debug, Default)]
pub struct NullTx;

impl Tx for NullTx {
    fn note_write(&self, _addr: SegAddr) {}
    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

/// A `Tx` that records the addresses it saw, for assertions in tests that
/// check which nodes a state-machine step actually touched.
#[derive(Debug, Default)]
pub struct RecordingTx {
    writes: Mutex<Vec<SegAddr>>,
}

impl RecordingTx {
    pub fn new() -> Self {
        RecordingTx::default()
    }

    pub fn writes(&self) -> Vec<SegAddr> {
        self.writes.lock().clone()
    }
}

impl Tx for RecordingTx {
    fn note_write(&self, addr: SegAddr) {
        self.writes.lock().push(addr);
    }
    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

/// A single persisted node's backing bytes.
///
/// Deliberately non-generic (no `with_bytes<R>(..)` closure API) so that
/// `Segment` and, transitively, `NodeFormat` remain object-safe: the cache
/// and state machine dispatch node formats through `&dyn NodeFormat` chosen
/// at load time by `node_type_id` (spec.md §4.2).
pub trait Segment: Send + Sync {
    /// The node's address, as handed out by the allocator that produced it.
    fn addr(&self) -> SegAddr;
    /// Copies `out.len()` bytes starting at `offset` into `out`.
    fn read_at(&self, offset: usize, out: &mut [u8]);
    /// Copies `bytes` into the segment starting at `offset`.
    fn write_at(&self, offset: usize, bytes: &[u8]);
}

/// Allocator/store for fixed-size segments (spec.md §1: "`SegAlloc`: an
/// external segment allocator"). The engine calls `alloc`/`free`/`get`
/// and otherwise never reasons about the backing storage.
pub trait SegAlloc: Send + Sync {
    /// Allocates a new segment of `2^shift` bytes, returning its address.
    fn alloc(&self, shift: u8, tx: &dyn Tx) -> Result<SegAddr>;
    /// Marks `addr` free. Actual reclamation may be deferred by the
    /// allocator; the engine only calls this once a node's refcount has
    /// reached zero (spec.md §4.3 "delayed free").
    fn free(&self, addr: SegAddr, tx: &dyn Tx) -> Result<()>;
    /// Returns a handle to the bytes backing `addr`.
    fn get(&self, addr: SegAddr) -> Result<std::sync::Arc<dyn Segment>>;
}

const SEGMENT_SIZE: usize = 1 << 24;

/// In-memory `Segment` backed by a `Vec<u8>` guarded by a mutex, for test
/// use only — a real implementation would mmap a pool file or NVM region.
pub struct MemSegment {
    addr: SegAddr,
    bytes: Mutex<Vec<u8>>,
}

impl MemSegment {
    fn new(addr: SegAddr) -> Self {
        MemSegment { addr, bytes: Mutex::new(vec![0u8; addr.size()]) }
    }
}

impl Segment for MemSegment {
    fn addr(&self) -> SegAddr {
        self.addr
    }

    fn read_at(&self, offset: usize, out: &mut [u8]) {
        let bytes = self.bytes.lock();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut guard = self.bytes.lock();
        guard[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// In-memory worst-fit bitmap `SegAlloc`, modeled on the teacher's
/// `WorstFitList` (one bit per 512-byte unit, a side list of free runs for
/// O(free-run-count) allocation instead of a bitmap scan).
pub struct MemSegAlloc {
    inner: Mutex<MemSegAllocInner>,
}

struct MemSegAllocInner {
    bits: BitVec<u8, Lsb0>,
    free_runs: Vec<(u64, u64)>,
    segments: rustc_hash::FxHashMap<u64, std::sync::Arc<MemSegment>>,
}

impl MemSegAlloc {
    /// Builds an allocator over a region of `len_units` 512-byte units.
    pub fn new(len_units: u64) -> Self {
        MemSegAlloc {
            inner: Mutex::new(MemSegAllocInner {
                bits: BitVec::repeat(false, len_units as usize),
                free_runs: vec![(0, len_units)],
                segments: rustc_hash::FxHashMap::default(),
            }),
        }
    }

    fn mark(inner: &mut MemSegAllocInner, start_unit: u64, units: u64, allocate: bool) {
        let range = start_unit as usize..(start_unit + units) as usize;
        inner.bits[range].fill(allocate);
    }
}

impl SegAlloc for MemSegAlloc {
    fn alloc(&self, shift: u8, _tx: &dyn Tx) -> Result<SegAddr> {
        let units = (1u64 << shift) / 512;
        let mut inner = self.inner.lock();

        let mut worst: Option<usize> = None;
        let mut worst_units = 0u64;
        for (i, &(_, run_units)) in inner.free_runs.iter().enumerate() {
            if run_units >= units && run_units > worst_units {
                worst = Some(i);
                worst_units = run_units;
            }
        }

        let idx = worst.ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?;
        let (run_start, run_units) = inner.free_runs[idx];
        Self::mark(&mut inner, run_start, units, true);
        if run_units == units {
            inner.free_runs.remove(idx);
        } else {
            inner.free_runs[idx] = (run_start + units, run_units - units);
        }

        let addr = SegAddr::build(run_start * 512, shift)
            .map_err(|_| Error::from(ErrorKind::OutOfMemory))?;
        inner.segments.insert(addr.raw(), std::sync::Arc::new(MemSegment::new(addr)));
        Ok(addr)
    }

    fn free(&self, addr: SegAddr, _tx: &dyn Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        let start_unit = addr.addr() / 512;
        let units = (addr.size() as u64) / 512;
        Self::mark(&mut inner, start_unit, units, false);
        inner.free_runs.push((start_unit, units));
        inner.segments.remove(&addr.raw());
        Ok(())
    }

    fn get(&self, addr: SegAddr) -> Result<std::sync::Arc<dyn Segment>> {
        let inner = self.inner.lock();
        inner
            .segments
            .get(&addr.raw())
            .cloned()
            .map(|s| s as std::sync::Arc<dyn Segment>)
            .ok_or_else(|| ErrorKind::DataFault(addr).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_read_write_roundtrip() {
        let alloc = MemSegAlloc::new((SEGMENT_SIZE / 512) as u64);
        let tx = NullTx;
        let addr = alloc.alloc(12, &tx).unwrap();
        let seg = alloc.get(addr).unwrap();
        seg.write_at(0, b"hello");
        let mut buf = [0u8; 5];
        seg.read_at(0, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn free_then_realloc_reuses_space() {
        let alloc = MemSegAlloc::new((SEGMENT_SIZE / 512) as u64);
        let tx = NullTx;
        let a = alloc.alloc(12, &tx).unwrap();
        alloc.free(a, &tx).unwrap();
        let b = alloc.alloc(12, &tx).unwrap();
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn out_of_memory_when_exhausted() {
        let alloc = MemSegAlloc::new(8); // 8 units * 512 = 4096 bytes total
        let tx = NullTx;
        alloc.alloc(12, &tx).unwrap(); // takes all 4096 bytes
        assert!(alloc.alloc(9, &tx).is_err());
    }
}
