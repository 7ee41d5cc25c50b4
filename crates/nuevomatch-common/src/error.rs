//! Error types for container parsing

use thiserror::Error;

/// Errors raised while reading a packed binary object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The buffer ended before the requested scalar or object
    #[error("truncated object: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the read required
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// A length prefix pointed past the end of the enclosing buffer
    #[error("nested object of {declared} bytes exceeds remaining {available} bytes")]
    BadLengthPrefix {
        /// Declared nested object length
        declared: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// A count or enum tag field held a value outside its domain
    #[error("invalid field value: {0}")]
    InvalidValue(String),
}

/// Result alias for container reads
pub type ReadResult<T> = Result<T, ReadError>;
