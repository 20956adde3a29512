//! Node abstraction: [`format::NodeFormat`] is the polymorphic capability
//! trait (spec.md §4.2); [`fixed::FixedFormat`] is the one mandatory
//! variant. New variants plug in by registering with
//! [`resolve_format`] without touching any consumer (cache, state machine).

pub mod fixed;
pub mod format;
pub mod header;

use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::node::fixed::{FixedFormat, FIXED_FORMAT_TYPE_ID};
use crate::node::format::NodeFormat;
use crate::node::header::{read_u32, NODE_TYPE_ID_OFFSET};
use crate::segalloc::Segment;

/// Reads the `node_type_id` straight out of a segment's common header,
/// before any format has been chosen — used by the cache on `get` to
/// dispatch to the right [`NodeFormat`] (spec.md §9 "resolved at load
/// time").
pub fn peek_node_type_id(seg: &dyn Segment) -> u32 {
    let mut buf = [0u8; 4];
    seg.read_at(NODE_TYPE_ID_OFFSET, &mut buf);
    read_u32(&buf, 0)
}

/// Resolves a `node_type_id` to its `NodeFormat` implementation.
///
/// Only [`FixedFormat`] is implemented; the three other format kinds named
/// in spec.md §4.2 (fixed-key/variable-value, variable-key/fixed-value,
/// fully variable) are reserved `node_type_id`s with no registered
/// implementation yet.
pub fn resolve_format(node_type_id: u32) -> Result<Arc<dyn NodeFormat>> {
    match node_type_id {
        FIXED_FORMAT_TYPE_ID => Ok(Arc::new(FixedFormat::new())),
        other => Err(Error::from(ErrorKind::Unsupported(format!(
            "no NodeFormat registered for node_type_id {other}"
        )))),
    }
}
