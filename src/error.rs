//! Error types.

use std::{fmt, io};

use thiserror::Error;

/// Which operation was handed a bad pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocOp {
    Free,
    Reallocate,
}

impl fmt::Display for AllocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Reallocate => f.write_str("realloc"),
        }
    }
}

/// Everything that can go wrong in an [`InstrumentedAlloc`] call. None of
/// these leave the allocator in a different state than before the call.
///
/// [`InstrumentedAlloc`]: crate::alloc::InstrumentedAlloc
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Asked for a zero byte block.
    #[error("trying to allocate 0 bytes")]
    ZeroSizeRequest,

    /// Handed a null pointer.
    #[error("trying to {op} null pointer")]
    NullPointer { op: AllocOp },

    /// Handed a pointer whose header doesn't carry the live guard tag. This is
    /// a double free, a pointer from somewhere else, or a trampled header.
    #[error("{op} unknown memory at {address:#x}")]
    UnknownMemory { op: AllocOp, address: usize },

    /// Asked for a type that needs more alignment than blocks get.
    #[error("alignment of {align} bytes is more than a block provides")]
    Misaligned { align: usize },

    /// The underlying heap had nothing left, or the request can't be
    /// represented.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
}

/// A bad value in the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected one of 1/0/true/false/on/off/yes/no, got {value:?}")]
    InvalidFlag { var: &'static str, value: String },

    #[error("{var}: expected a positive integer, got {value:?}")]
    InvalidCount { var: &'static str, value: String },
}

/// Failure to read or write a [`LeakReport`].
///
/// [`LeakReport`]: crate::alloc::report::LeakReport
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReportIoError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
