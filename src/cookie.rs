//! [`Cookie`] — an opaque fast-path hint to a previously-known leaf
//! (spec.md §3 C7, §4.6.1 COOKIE state). Per spec.md §9: "cookies are a
//! pure optimisation — correctness must not depend on their acceptance
//! path." The `COOKIE` state here only ever short-circuits *descent*; the
//! subsequent CHECK still runs exactly as it would for a fully-descended
//! path.

use crate::segaddr::SegAddr;

/// A hint returned alongside a successful operation, usable on a later
/// call to skip tree descent if the leaf is still valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    pub leaf_addr: SegAddr,
    pub seq: u64,
}

impl Cookie {
    pub fn new(leaf_addr: SegAddr, seq: u64) -> Self {
        Cookie { leaf_addr, seq }
    }

    /// Whether this cookie still matches the live descriptor's sequence
    /// number — the only validation the state machine is allowed to trust
    /// before falling back to full descent.
    pub fn still_valid(&self, current_seq: u64) -> bool {
        self.seq == current_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stale_seq() {
        let addr = SegAddr::build(4096, 12).unwrap();
        let cookie = Cookie::new(addr, 3);
        assert!(cookie.still_valid(3));
        assert!(!cookie.still_valid(4));
    }
}
