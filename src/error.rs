//! Error types shared across the store.

use std::io;
use thiserror::Error;

/// Errors raised at the engine boundary and by the I/O layers.
///
/// Structural page algorithms never construct these; they communicate
/// outcomes through result variants and only the engine surfaces errors.
#[derive(Debug, Error)]
pub enum Error {
    /// `get` was called for a key that is not in the tree.
    #[error("key not found")]
    KeyNotFound,

    /// An operation was attempted in an invalid state (e.g. on a closed
    /// tree).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// File, channel or serialization I/O failed.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// A read could not be satisfied outside of a normal end-of-stream,
    /// or decoded data was structurally invalid.
    #[error("corrupted stream: {0}")]
    Corruption(String),

    /// Clean end of input at a record boundary.
    #[error("end of input")]
    EndOfInput,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
