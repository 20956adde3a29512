//! `FixedFormat` — the one mandatory [`NodeFormat`] variant: both key and
//! value are fixed-size (spec.md §4.2). The other three documented variants
//! (fixed-key/variable-value, variable-key/fixed-value, fully variable) are
//! reserved for future work and have no implementation here.

#[cfg(feature = "internal-api")]
use serde_json::json;

use crate::error::{Error, ErrorKind, Result};
use crate::node::format::{Direction, FindResult, MoveCount, NodeFormat, Record, Slot};
use crate::node::header::*;
use crate::segaddr::SegAddr;
use crate::segalloc::{Segment, Tx};

/// Registered `node_type_id` for [`FixedFormat`].
pub const FIXED_FORMAT_TYPE_ID: u32 = 1;

struct Meta {
    used: u16,
    shift: u8,
    level: u8,
    ksize: u16,
    vsize: u16,
}

/// Fixed key/value-size node layout (spec.md §6 "Fixed-format additions").
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedFormat;

impl FixedFormat {
    pub fn new() -> Self {
        FixedFormat
    }

    fn read_meta(&self, seg: &dyn Segment) -> Meta {
        let mut buf = [0u8; FIXED_HEADER_LEN];
        seg.read_at(0, &mut buf);
        Meta {
            used: read_u16(&buf, USED_OFFSET),
            shift: buf[SHIFT_OFFSET],
            level: buf[LEVEL_OFFSET],
            ksize: read_u16(&buf, KSIZE_OFFSET),
            vsize: read_u16(&buf, VSIZE_OFFSET),
        }
    }

    fn write_used(&self, seg: &dyn Segment, used: u16) {
        let mut buf = [0u8; 2];
        write_u16(&mut buf, 0, used);
        seg.write_at(USED_OFFSET, &buf);
    }

    fn record_size(&self, meta: &Meta) -> usize {
        meta.ksize as usize + meta.vsize as usize
    }

    fn record_offset(&self, rs: usize, idx: usize) -> usize {
        FIXED_HEADER_LEN + idx * rs
    }

    fn capacity_bytes(&self, meta: &Meta) -> usize {
        (1usize << meta.shift) - FIXED_HEADER_LEN
    }

    /// Dumps the header fields as JSON, for `log::trace!` diagnostics and
    /// out-of-tree debugging tools — never parsed back, so format
    /// stability isn't a concern.
    #[cfg(feature = "internal-api")]
    pub fn dump_header_json(&self, seg: &dyn Segment) -> serde_json::Value {
        let meta = self.read_meta(seg);
        json!({
            "addr": format!("{:?}", seg.addr()),
            "used": meta.used,
            "shift": meta.shift,
            "level": meta.level,
            "ksize": meta.ksize,
            "vsize": meta.vsize,
            "space_free": self.space_free(seg),
            "verified": self.verify(seg),
        })
    }
}

impl NodeFormat for FixedFormat {
    fn type_id(&self) -> u32 {
        FIXED_FORMAT_TYPE_ID
    }

    fn init(
        &self,
        seg: &dyn Segment,
        shift: u8,
        ksize: u16,
        vsize: u16,
        tree_type_id: u32,
        tx: &dyn Tx,
    ) -> Result<()> {
        let mut header = vec![0u8; FIXED_HEADER_LEN];
        write_u32(&mut header, MAGIC_OFFSET, FIXED_MAGIC);
        write_u16(&mut header, VERSION_OFFSET, FIXED_VERSION);
        write_u32(&mut header, NODE_TYPE_ID_OFFSET, self.type_id());
        write_u32(&mut header, TREE_TYPE_ID_OFFSET, tree_type_id);
        write_u64(&mut header, OPAQUE_HINT_OFFSET, 0);
        write_u16(&mut header, USED_OFFSET, 0);
        header[SHIFT_OFFSET] = shift;
        header[LEVEL_OFFSET] = 0;
        write_u16(&mut header, KSIZE_OFFSET, ksize);
        write_u16(&mut header, VSIZE_OFFSET, vsize);
        write_u64(&mut header, CHECKSUM_OFFSET, 0);
        seg.write_at(0, &header);
        self.fix(seg, tx)
    }

    fn fini(&self, seg: &dyn Segment, tx: &dyn Tx) -> Result<()> {
        tx.note_write(seg.addr());
        Ok(())
    }

    fn count(&self, seg: &dyn Segment) -> usize {
        self.read_meta(seg).used as usize
    }

    fn count_rec(&self, seg: &dyn Segment) -> usize {
        let meta = self.read_meta(seg);
        if meta.level == 0 {
            meta.used as usize
        } else {
            (meta.used as usize).saturating_sub(1)
        }
    }

    fn space_free(&self, seg: &dyn Segment) -> usize {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        self.capacity_bytes(&meta) - meta.used as usize * rs
    }

    fn level(&self, seg: &dyn Segment) -> u8 {
        self.read_meta(seg).level
    }

    fn shift(&self, seg: &dyn Segment) -> u8 {
        self.read_meta(seg).shift
    }

    fn keysize(&self, seg: &dyn Segment) -> u16 {
        self.read_meta(seg).ksize
    }

    fn valsize(&self, seg: &dyn Segment) -> u16 {
        self.read_meta(seg).vsize
    }

    fn is_underflow(&self, seg: &dyn Segment, predict_after_one_delete: bool) -> bool {
        let meta = self.read_meta(seg);
        let used = if predict_after_one_delete {
            meta.used.saturating_sub(1)
        } else {
            meta.used
        } as usize;
        if meta.level == 0 {
            used == 0
        } else {
            used.saturating_sub(1) <= 1
        }
    }

    fn is_overflow(&self, seg: &dyn Segment) -> bool {
        !self.is_fit(seg, 1)
    }

    fn is_fit(&self, seg: &dyn Segment, extra_records: usize) -> bool {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        self.space_free(seg) >= extra_records * rs
    }

    fn rec(&self, seg: &dyn Segment, slot: Slot) -> Record {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        let mut buf = vec![0u8; rs];
        seg.read_at(self.record_offset(rs, slot.idx), &mut buf);
        let (key, value) = buf.split_at(meta.ksize as usize);
        Record { key: key.to_vec(), value: value.to_vec() }
    }

    fn key(&self, seg: &dyn Segment, slot: Slot) -> Vec<u8> {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        let mut buf = vec![0u8; meta.ksize as usize];
        seg.read_at(self.record_offset(rs, slot.idx), &mut buf);
        buf
    }

    fn child(&self, seg: &dyn Segment, slot: Slot) -> Result<SegAddr> {
        let meta = self.read_meta(seg);
        if meta.vsize != 8 {
            return Err(ErrorKind::Unsupported("child() requires an 8-byte value".into()).into());
        }
        let rs = self.record_size(&meta);
        let mut vbuf = [0u8; 8];
        seg.read_at(self.record_offset(rs, slot.idx) + meta.ksize as usize, &mut vbuf);
        let raw = read_u64(&vbuf, 0);
        SegAddr::from_raw(raw).map_err(|_| Error::from(ErrorKind::InvalidSegAddr(raw)))
    }

    fn find(&self, seg: &dyn Segment, key: &[u8]) -> FindResult {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        let used = meta.used as usize;

        let (mut lo, mut hi) = (0usize, used);
        let mut kbuf = vec![0u8; meta.ksize as usize];
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            seg.read_at(self.record_offset(rs, mid), &mut kbuf);
            if kbuf.as_slice() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = if lo < used {
            seg.read_at(self.record_offset(rs, lo), &mut kbuf);
            kbuf.as_slice() == key
        } else {
            false
        };
        FindResult { idx: lo, exact }
    }

    fn make(&self, seg: &dyn Segment, slot: Slot, tx: &dyn Tx) -> Result<()> {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        let used = meta.used as usize;
        let idx = slot.idx.min(used);

        let tail_len = (used - idx) * rs;
        if tail_len > 0 {
            let mut tail = vec![0u8; tail_len];
            seg.read_at(self.record_offset(rs, idx), &mut tail);
            seg.write_at(self.record_offset(rs, idx + 1), &tail);
        }
        self.write_used(seg, meta.used + 1);
        tx.note_write(seg.addr());
        Ok(())
    }

    fn write_record(&self, seg: &dyn Segment, slot: Slot, rec: &Record, tx: &dyn Tx) -> Result<()> {
        let meta = self.read_meta(seg);
        if rec.key.len() != meta.ksize as usize || rec.value.len() != meta.vsize as usize {
            return Err(ErrorKind::MalformedRecord.into());
        }
        let rs = self.record_size(&meta);
        let offset = self.record_offset(rs, slot.idx);
        seg.write_at(offset, &rec.key);
        seg.write_at(offset + meta.ksize as usize, &rec.value);
        tx.note_write(seg.addr());
        Ok(())
    }

    fn del(&self, seg: &dyn Segment, slot: Slot, tx: &dyn Tx) -> Result<()> {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);
        let used = meta.used as usize;
        if slot.idx >= used {
            return Err(ErrorKind::KeyNotFound.into());
        }
        let tail_len = (used - slot.idx - 1) * rs;
        if tail_len > 0 {
            let mut tail = vec![0u8; tail_len];
            seg.read_at(self.record_offset(rs, slot.idx + 1), &mut tail);
            seg.write_at(self.record_offset(rs, slot.idx), &tail);
        }
        self.write_used(seg, meta.used - 1);
        tx.note_write(seg.addr());
        Ok(())
    }

    fn cut(&self, _seg: &dyn Segment, _slot: Slot, _size: usize, _tx: &dyn Tx) -> Result<()> {
        Err(ErrorKind::Unsupported("cut: fixed-size values never need truncation".into()).into())
    }

    fn set_level(&self, seg: &dyn Segment, level: u8, tx: &dyn Tx) -> Result<()> {
        seg.write_at(LEVEL_OFFSET, &[level]);
        tx.note_write(seg.addr());
        Ok(())
    }

    fn fix(&self, seg: &dyn Segment, tx: &dyn Tx) -> Result<()> {
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);

        let mut header = vec![0u8; FIXED_HEADER_LEN];
        seg.read_at(0, &mut header);
        for b in &mut header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8] {
            *b = 0;
        }
        let mut records = vec![0u8; meta.used as usize * rs];
        seg.read_at(FIXED_HEADER_LEN, &mut records);

        header.extend_from_slice(&records);
        let checksum = fnv1a(&header);

        let mut cbuf = [0u8; 8];
        write_u64(&mut cbuf, 0, checksum);
        seg.write_at(CHECKSUM_OFFSET, &cbuf);
        tx.note_write(seg.addr());
        Ok(())
    }

    fn move_records(
        &self,
        src: &dyn Segment,
        tgt: &dyn Segment,
        dir: Direction,
        nr: MoveCount,
        tx: &dyn Tx,
    ) -> Result<usize> {
        let src_meta = self.read_meta(src);
        let tgt_meta = self.read_meta(tgt);
        let rs = self.record_size(&src_meta);
        let src_used = src_meta.used as usize;
        let tgt_used = tgt_meta.used as usize;
        let src_cap = self.capacity_bytes(&src_meta);
        let tgt_cap = self.capacity_bytes(&tgt_meta);

        let free_of = |cap: usize, used: usize| cap - used * rs;

        let n = match nr {
            MoveCount::Exactly(n) => n.min(src_used),
            MoveCount::Max => (free_of(tgt_cap, tgt_used) / rs).min(src_used),
            MoveCount::Even => {
                let (mut s, mut t, mut n) = (src_used, tgt_used, 0usize);
                loop {
                    if s == 0 || (t + 1) * rs > tgt_cap {
                        break;
                    }
                    let before = free_of(src_cap, s).abs_diff(free_of(tgt_cap, t));
                    let after = free_of(src_cap, s - 1).abs_diff(free_of(tgt_cap, t + 1));
                    if after >= before {
                        break;
                    }
                    s -= 1;
                    t += 1;
                    n += 1;
                }
                n
            }
        };
        if n == 0 {
            return Ok(0);
        }

        let (src_start_idx, mut buf) = match dir {
            Direction::Left => (0usize, vec![0u8; n * rs]),
            Direction::Right => (src_used - n, vec![0u8; n * rs]),
        };
        src.read_at(self.record_offset(rs, src_start_idx), &mut buf);

        match dir {
            Direction::Left => {
                let tail_len = (src_used - n) * rs;
                if tail_len > 0 {
                    let mut tail = vec![0u8; tail_len];
                    src.read_at(self.record_offset(rs, n), &mut tail);
                    src.write_at(FIXED_HEADER_LEN, &tail);
                }
            }
            Direction::Right => {
                // records [0..src_start_idx) are untouched; only `used` shrinks.
            }
        }

        match dir {
            Direction::Left => {
                tgt.write_at(self.record_offset(rs, tgt_used), &buf);
            }
            Direction::Right => {
                if tgt_used > 0 {
                    let mut existing = vec![0u8; tgt_used * rs];
                    tgt.read_at(FIXED_HEADER_LEN, &mut existing);
                    tgt.write_at(self.record_offset(rs, n), &existing);
                }
                tgt.write_at(FIXED_HEADER_LEN, &buf);
            }
        }

        self.write_used(src, (src_used - n) as u16);
        self.write_used(tgt, (tgt_used + n) as u16);
        self.fix(src, tx)?;
        self.fix(tgt, tx)?;
        Ok(n)
    }

    fn invariant(&self, seg: &dyn Segment) -> bool {
        let meta = self.read_meta(seg);
        if meta.shift != seg.addr().shift() {
            return false;
        }
        if meta.used == 0 && meta.level != 0 {
            return false;
        }
        let rs = self.record_size(&meta);
        if rs == 0 {
            return false;
        }
        meta.used as usize * rs <= self.capacity_bytes(&meta)
    }

    fn verify(&self, seg: &dyn Segment) -> bool {
        if !self.is_valid(seg) {
            return false;
        }
        let meta = self.read_meta(seg);
        let rs = self.record_size(&meta);

        let mut header = vec![0u8; FIXED_HEADER_LEN];
        seg.read_at(0, &mut header);
        let stored = read_u64(&header, CHECKSUM_OFFSET);
        for b in &mut header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8] {
            *b = 0;
        }
        let mut records = vec![0u8; meta.used as usize * rs];
        seg.read_at(FIXED_HEADER_LEN, &mut records);
        header.extend_from_slice(&records);

        fnv1a(&header) == stored
    }

    fn is_valid(&self, seg: &dyn Segment) -> bool {
        let mut buf = [0u8; 6];
        seg.read_at(0, &mut buf);
        read_u32(&buf, 0) == FIXED_MAGIC && read_u16(&buf, 4) == FIXED_VERSION
    }

    fn opaque_set(&self, seg: &dyn Segment, hint: u64) {
        let mut buf = [0u8; 8];
        write_u64(&mut buf, 0, hint);
        seg.write_at(OPAQUE_HINT_OFFSET, &buf);
    }

    fn opaque_get(&self, seg: &dyn Segment) -> u64 {
        let mut buf = [0u8; 8];
        seg.read_at(OPAQUE_HINT_OFFSET, &mut buf);
        read_u64(&buf, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segalloc::{MemSegAlloc, NullTx, SegAlloc};

    fn fresh_node(alloc: &MemSegAlloc, shift: u8, ksize: u16, vsize: u16) -> std::sync::Arc<dyn Segment> {
        let tx = NullTx;
        let addr = alloc.alloc(shift, &tx).unwrap();
        let seg = alloc.get(addr).unwrap();
        FixedFormat::new().init(seg.as_ref(), shift, ksize, vsize, 7, &tx).unwrap();
        seg
    }

    #[test]
    fn init_and_verify_roundtrip() {
        let alloc = MemSegAlloc::new((1 << 20) / 512);
        let seg = fresh_node(&alloc, 12, 8, 8);
        let fmt = FixedFormat::new();
        assert!(fmt.is_valid(seg.as_ref()));
        assert!(fmt.verify(seg.as_ref()));
        assert_eq!(fmt.count(seg.as_ref()), 0);
        assert_eq!(fmt.level(seg.as_ref()), 0);
    }

    #[test]
    #[cfg(feature = "internal-api")]
    fn header_dump_reflects_live_state() {
        let alloc = MemSegAlloc::new((1 << 20) / 512);
        let seg = fresh_node(&alloc, 12, 8, 8);
        let fmt = FixedFormat::new();
        let dump = fmt.dump_header_json(seg.as_ref());
        assert_eq!(dump["used"], 0);
        assert_eq!(dump["shift"], 12);
        assert_eq!(dump["verified"], true);
    }

    #[test]
    fn make_write_find_del_roundtrip() {
        let alloc = MemSegAlloc::new((1 << 20) / 512);
        let seg = fresh_node(&alloc, 12, 8, 8);
        let fmt = FixedFormat::new();
        let tx = NullTx;

        for k in [10u64, 30, 20].iter() {
            let r = fmt.find(seg.as_ref(), &k.to_be_bytes());
            assert!(!r.exact);
            fmt.make(seg.as_ref(), Slot { idx: r.idx }, &tx).unwrap();
            fmt.write_record(
                seg.as_ref(),
                Slot { idx: r.idx },
                &Record { key: k.to_be_bytes().to_vec(), value: k.to_be_bytes().to_vec() },
                &tx,
            )
            .unwrap();
            fmt.fix(seg.as_ref(), &tx).unwrap();
        }
        assert_eq!(fmt.count(seg.as_ref()), 3);
        assert!(fmt.verify(seg.as_ref()));

        let r = fmt.find(seg.as_ref(), &20u64.to_be_bytes());
        assert!(r.exact);
        assert_eq!(fmt.key(seg.as_ref(), Slot { idx: 0 }), 10u64.to_be_bytes());
        assert_eq!(fmt.key(seg.as_ref(), Slot { idx: 1 }), 20u64.to_be_bytes());
        assert_eq!(fmt.key(seg.as_ref(), Slot { idx: 2 }), 30u64.to_be_bytes());

        fmt.del(seg.as_ref(), Slot { idx: 1 }, &tx).unwrap();
        assert_eq!(fmt.count(seg.as_ref()), 2);
        assert!(!fmt.find(seg.as_ref(), &20u64.to_be_bytes()).exact);
    }

    #[test]
    fn move_left_then_right_restores_original_order() {
        let alloc = MemSegAlloc::new((1 << 20) / 512);
        let src = fresh_node(&alloc, 9, 8, 8);
        let tgt = fresh_node(&alloc, 9, 8, 8);
        let fmt = FixedFormat::new();
        let tx = NullTx;

        for (i, k) in [1u64, 2, 3, 4].iter().enumerate() {
            fmt.make(src.as_ref(), Slot { idx: i }, &tx).unwrap();
            fmt.write_record(
                src.as_ref(),
                Slot { idx: i },
                &Record { key: k.to_be_bytes().to_vec(), value: k.to_be_bytes().to_vec() },
                &tx,
            )
            .unwrap();
        }
        fmt.fix(src.as_ref(), &tx).unwrap();

        let moved = fmt
            .move_records(src.as_ref(), tgt.as_ref(), Direction::Left, MoveCount::Exactly(2), &tx)
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(fmt.count(src.as_ref()), 2);
        assert_eq!(fmt.count(tgt.as_ref()), 2);
        assert_eq!(fmt.key(tgt.as_ref(), Slot { idx: 0 }), 1u64.to_be_bytes());
        assert_eq!(fmt.key(tgt.as_ref(), Slot { idx: 1 }), 2u64.to_be_bytes());
        assert_eq!(fmt.key(src.as_ref(), Slot { idx: 0 }), 3u64.to_be_bytes());

        let moved_back = fmt
            .move_records(tgt.as_ref(), src.as_ref(), Direction::Right, MoveCount::Exactly(2), &tx)
            .unwrap();
        assert_eq!(moved_back, 2);
        assert_eq!(fmt.count(src.as_ref()), 4);
        assert_eq!(fmt.count(tgt.as_ref()), 0);
        for (i, k) in [1u64, 2, 3, 4].iter().enumerate() {
            assert_eq!(fmt.key(src.as_ref(), Slot { idx: i }), k.to_be_bytes());
        }
    }
}
