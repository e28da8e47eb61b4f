//! Kestrel error types.

use thiserror::Error;

/// Kestrel Error types.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// An address is not covered by memory, is not readable, or a write
    /// would conflict with a decoded instruction.
    #[error("memory access denied: {0}")]
    AccessDenied(String),

    /// A new or moved block would intersect existing memory, or would span
    /// the image base in the default space.
    #[error("memory conflict: {0}")]
    RangeConflict(String),

    /// Address arithmetic exceeded the bounds of its address space.
    #[error("address overflow: {0}")]
    Overflow(String),

    /// An overlay space name is already in use.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// The operation is not legal for this block kind.
    #[error("invalid block kind: {0}")]
    InvalidKind(String),

    /// The caller does not hold exclusive access to the program.
    #[error("exclusive access required: {0}")]
    LockViolation(String),

    /// A block or space is not a member of this memory map.
    #[error("not found: {0}")]
    NotFound(String),

    /// A task monitor cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The record store failed.
    #[error("record store error: {0}")]
    Store(String),

    /// The operation is forbidden while a live-memory handler is active.
    #[error("live memory is active: {0}")]
    StateConflict(String),

    /// Catch-all for errors which don't fit the other variants.
    #[error("{0}")]
    Custom(String),
}

impl From<String> for Error {
    fn from(message: String) -> Error {
        Error::Custom(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Error {
        Error::Custom(message.to_string())
    }
}
