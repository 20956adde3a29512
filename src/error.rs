//! Error taxonomy (spec.md §7).
//!
//! The core `Error`/`ErrorKind` pair follows the `error_chain` idiom used
//! throughout the teacher crate's tree and database modules (e.g.
//! `Error(ErrorKind::DoesNotExist, _)`, `bail!`, `ensure!`).

use error_chain::error_chain;

use crate::segaddr::SegAddr;

error_chain! {
    errors {
        /// Descriptor or per-operation scratch allocation failed.
        OutOfMemory {
            description("allocation of descriptor or scratch state failed")
        }
        /// A persistent pointer failed its validity/in-segment check, or a
        /// node's `verify` call failed mid-descent.
        DataFault(addr: SegAddr) {
            description("node failed validation")
            display("node at {:?} failed validation", addr)
        }
        /// Exhausted the 3 optimistic trials and the 3 lock-all trials
        /// (spec.md §4.6.1 CHECK, §5 restart policy).
        TooManyRestarts {
            description("operation exhausted its restart budget")
        }
        /// The key was already present (insert).
        KeyExists {
            description("key already exists")
        }
        /// The key was absent (lookup/delete).
        KeyNotFound {
            description("key not found")
        }
        /// Iteration ran past the first/last key.
        Boundary {
            description("iteration reached a tree boundary")
        }
        /// `close` could not drain the tree's active node list within the
        /// configured deadline (spec.md §5: "waits up to 5 seconds").
        Timeout {
            description("operation timed out waiting for tree drain")
        }
        /// The caller's callback returned an error, requesting undo.
        CallbackError(msg: String) {
            description("callback rejected the operation")
            display("callback error: {}", msg)
        }
        /// A raw value failed `SegAddr`'s bit-layout validity check.
        InvalidSegAddr(raw: u64) {
            description("segment address failed validity check")
            display("segment address {:#x} is invalid", raw)
        }
        /// A `NodeFormat` operation not implemented by this variant
        /// (spec.md §9: `nt_cut` is "optional for future variable-size
        /// -value formats").
        Unsupported(op: String) {
            description("operation unsupported by this node format")
            display("unsupported: {}", op)
        }
        /// The fixed-size tree-descriptor slot pool has no free slots.
        TreePoolExhausted {
            description("no free tree-descriptor slots")
        }
        /// `destroy` was called on a tree whose root is not empty.
        NotEmpty {
            description("tree root is not empty")
        }
        /// An empty key was supplied where one is required.
        EmptyKey {
            description("key must not be empty")
        }
        /// A record's key/value length does not match the node's
        /// configured `ksize`/`vsize`.
        MalformedRecord {
            description("record key/value size does not match node format")
        }
    }
}

/// Error type returned by caller-supplied act callbacks (spec.md §6
/// "Callback protocol": "must return 0 on success or a nonzero error to
/// request undo"). Wraps whatever the caller's closure produced.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct CallbackError {
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl CallbackError {
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        CallbackError { source: Box::new(source) }
    }
}

impl From<CallbackError> for Error {
    fn from(e: CallbackError) -> Error {
        ErrorKind::CallbackError(e.source.to_string()).into()
    }
}
