use thiserror::Error;

/// Errors produced while parsing or decoding identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unexpected end of input while decoding {0}")]
    Truncated(&'static str),

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("invalid UTF-8 in encoded string: {0}")]
    InvalidUtf8(String),

    #[error("unknown node id tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("quadrant index out of range: {0}")]
    InvalidQuadrant(u8),
}

/// Result alias for identifier and codec operations.
pub type TypeResult<T> = Result<T, TypeError>;
