//! Error types for the index engine.

use std::io;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur in the index engine.
///
/// Duplicate keys and missing keys are not errors; they are reported through
/// [`crate::InsertOutcome`] and [`crate::DeleteOutcome`].
#[derive(Error, Debug)]
pub enum IndexError {
    /// Operation on a handle that is not an open index
    #[error("handle is not an open index file")]
    InvalidHandle,

    /// Key rejected by the length or content rules of the file
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Key length does not match the one stored in the header
    #[error("wrong key length: expected {expected}, found {found}")]
    BadKeyLength { expected: usize, found: usize },

    /// Fixed record length does not match the one stored in the header
    #[error("wrong record length: expected {expected}, found {found}")]
    BadRecordLength { expected: usize, found: usize },

    /// The file allows duplicate keys but the caller asked to forbid them
    #[error("index file was built with duplicate keys")]
    DuplicatesForbidden,

    /// Malformed header, bad block tag or a broken structural invariant
    #[error("index file is invalid: {0}")]
    IndexCorrupt(String),

    /// A block buffer could not be allocated
    #[error("unable to allocate memory")]
    NoMemory,

    /// Write attempted through a read-only handle
    #[error("attempted write on read-only index")]
    ReadOnly,

    /// Unusable file or record-file name
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// I/O error from the underlying store
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Lock could not be acquired or released
    #[error("unable to lock index file: {0}")]
    Lock(#[source] io::Error),

    /// Engine invariant violated; indicates a bug, not a runtime condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Create a corruption error with a message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::IndexCorrupt(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for defensive invariant failures that point at a logic bug
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Legacy negative status code for the integer call surface
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHandle => -21,
            Self::InvalidName(_) => -26,
            Self::IndexCorrupt(_) => -33,
            Self::BadKeyLength { .. } => -34,
            Self::BadRecordLength { .. } => -35,
            Self::InvalidKey(_) => -36,
            Self::NoMemory => -37,
            Self::Lock(_) => -41,
            Self::ReadOnly => -53,
            Self::DuplicatesForbidden => -60,
            Self::Internal(_) => -68,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => -22,
                io::ErrorKind::PermissionDenied => -23,
                _ => -38,
            },
        }
    }
}
