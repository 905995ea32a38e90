use arbor_types::{ObjectId, TypeError};

/// Errors from object store and key/value backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested tree was not found.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A binary record could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] TypeError),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes do not hash to the id they were stored under.
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectId, reason: String },

    /// Table names must be plain identifiers.
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
