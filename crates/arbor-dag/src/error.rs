//! Error types for the DAG overlay.

use arbor_store::StoreError;
use arbor_types::{ObjectId, TreeId, TypeError};

/// Errors that can occur while mutating, storing or rebuilding DAGs.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// A DAG id was created twice with different original trees.
    #[error("DAG {id} already exists mirroring {existing:?}, cannot recreate it for {requested:?}")]
    DuplicateTree {
        id: TreeId,
        existing: ObjectId,
        requested: ObjectId,
    },

    /// A batch fetch did not resolve every requested DAG.
    #[error("{} of {requested} requested DAGs are missing: {missing:?}", missing.len())]
    MissingTrees {
        requested: usize,
        missing: Vec<TreeId>,
    },

    /// A collapse gathered a different number of entries than recorded.
    #[error("child count mismatch collapsing {id}: expected {expected}, gathered {actual}")]
    CountMismatch {
        id: TreeId,
        expected: u64,
        actual: u64,
    },

    /// An entry id has no stored value.
    #[error("entry not found: {0}")]
    NodeNotFound(String),

    /// A lazy entry refers to a handle the tree cache never issued.
    #[error("unknown tree cache handle {0}")]
    InvalidTreeHandle(u32),

    /// A lazy entry points past the end of its cached tree.
    #[error("entry index {index} out of bounds for cached tree {handle} with {len} entries")]
    IndexOutOfBounds { handle: u32, index: u32, len: usize },

    #[error("invalid magic byte 0x{0:02x} in encoded entry")]
    InvalidMagic(u8),

    #[error("invalid DAG state {0}")]
    InvalidState(u8),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The background writer stopped on an error; reported at the next drain.
    #[error("background writer failed: {0}")]
    WorkerFailed(Box<DagError>),

    #[error("background writer panicked")]
    WorkerPanicked,

    #[error("store is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// Convenience alias for DAG results.
pub type DagResult<T> = Result<T, DagError>;
