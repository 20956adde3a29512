//! Common persistent node header (spec.md §6) and `FixedFormat`'s additional
//! fields. Pure offset/encoding constants — no I/O, no locking.

use byteorder::{BigEndian, ByteOrder};

/// `{magic: u32, version: u16, reserved: u16}` — spec.md's opaque
/// `format_header`, concretized here since this crate ships one format.
pub const MAGIC_OFFSET: usize = 0x00;
pub const VERSION_OFFSET: usize = 0x04;
pub const NODE_TYPE_ID_OFFSET: usize = 0x08;
pub const TREE_TYPE_ID_OFFSET: usize = 0x0C;
pub const OPAQUE_HINT_OFFSET: usize = 0x10;

/// End of the common header / start of `FixedFormat`'s own fields.
pub const COMMON_HEADER_LEN: usize = 0x18;

pub const FIXED_MAGIC: u32 = 0xB17_7EE5;
pub const FIXED_VERSION: u16 = 1;

// FixedFormat-specific fields, following the common header.
pub const USED_OFFSET: usize = COMMON_HEADER_LEN; // u16
pub const SHIFT_OFFSET: usize = USED_OFFSET + 2; // u8
pub const LEVEL_OFFSET: usize = SHIFT_OFFSET + 1; // u8
pub const KSIZE_OFFSET: usize = LEVEL_OFFSET + 1; // u16
pub const VSIZE_OFFSET: usize = KSIZE_OFFSET + 2; // u16
pub const CHECKSUM_OFFSET: usize = VSIZE_OFFSET + 2; // u64 "footer"
pub const FIXED_HEADER_LEN: usize = CHECKSUM_OFFSET + 8;

pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    BigEndian::read_u16(&buf[offset..offset + 2])
}

pub fn write_u16(buf: &mut [u8], offset: usize, v: u16) {
    BigEndian::write_u16(&mut buf[offset..offset + 2], v);
}

pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&buf[offset..offset + 4])
}

pub fn write_u32(buf: &mut [u8], offset: usize, v: u32) {
    BigEndian::write_u32(&mut buf[offset..offset + 4], v);
}

pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&buf[offset..offset + 8])
}

pub fn write_u64(buf: &mut [u8], offset: usize, v: u64) {
    BigEndian::write_u64(&mut buf[offset..offset + 8], v);
}

/// FNV-1a, used as `FixedFormat`'s footer checksum. Cheap, no external
/// crate pulled in purely for a node-integrity check (the teacher reserves
/// `twox-hash`/`gxhash` for its much larger storage-pool checksums, which
/// this crate drops — see DESIGN.md).
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
