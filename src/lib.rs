//! Persistent, concurrent B+-tree storage engine for metadata key-value
//! storage.
//!
//! A caller opens or creates a tree through [`Engine`], gets back a
//! [`TreeHandle`], and drives `get`/`put`/`del`/`iter` through it. Every
//! call runs one [`op::OpStateMachine`] to completion: optimistic descent,
//! a single exclusive critical section for the mutation itself, and
//! restart-with-escalation on contention (see [`op`] for the full state
//! machine). Node storage is delegated to an external [`segalloc::SegAlloc`]
//! + [`segalloc::Tx`] pair; this crate never reasons about durability
//! beyond what those collaborators already provide.

pub mod cache;
pub mod config;
pub mod cookie;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod node;
pub mod op;
pub mod segaddr;
pub mod segalloc;
pub mod tree_descriptor;

pub use cache::NodeCache;
pub use config::EngineConfig;
pub use cookie::Cookie;
pub use descriptor::NodeDescriptor;
pub use engine::{Engine, TreeHandle};
pub use error::{CallbackError, Error, ErrorKind, Result};
pub use node::fixed::FIXED_FORMAT_TYPE_ID;
pub use node::format::{Direction, FindResult, MoveCount, NodeFormat, Record, Slot};
pub use op::{ActFlag, ActSlot, IterDirection, OpFlags, OpOutcome, Opcode};
pub use segaddr::SegAddr;
pub use segalloc::{MemSegAlloc, MemSegment, NullTx, RecordingTx, SegAlloc, Segment, Tx};
pub use tree_descriptor::TreeDescriptor;

/// Installs `env_logger` as the global logger, the way the teacher's
/// `init_env_logger` feature wires up tracing for standalone binaries.
/// Library consumers embedding their own logger should not enable this
/// feature and should call `log::set_logger` themselves instead.
#[cfg(feature = "init_env_logger")]
pub fn init_logging() {
    let _ = env_logger::try_init();
}
