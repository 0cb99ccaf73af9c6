//! Error type shared by the whole crate.
//!
//! Every variant maps onto a distinct negative integer via [`Error::code`], which is
//! what the integer-code functions of [`crate::iapi`] hand back to embedding applications.
use thiserror::Error;

use crate::column::ColumnType;

/// Everything that can go wrong in this crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// null/zero-length buffer, unknown type tag, malformed name, ...
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// inconsistent shapes, e.g. index keys vs offsets or selection vs mesh dimensions
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// the named array, column or selection does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// an allocation failed; nothing was modified
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// the operation is not defined for this column type
    #[error("operation {op} is not supported on {ctype:?} columns")]
    UnsupportedType {
        /// type of the offending column
        ctype: ColumnType,
        /// what was attempted
        op: &'static str,
    },

    /// a where-clause could not be parsed
    #[error("parse error at byte {pos}: {msg}")]
    Parse {
        /// byte offset into the clause
        pos: usize,
        /// what went wrong
        msg: String,
    },

    /// a bit position beyond [`crate::bitvector::MAX_BITS`]
    #[error("bit position {0} exceeds the largest supported bitvector size")]
    BitPositionOverflow(u64),

    /// serialized index data is malformed
    #[error("corrupt index data: {0}")]
    Corrupt(String),

    /// an accessor was called before the step that computes its value
    #[error("{0} has not been computed yet")]
    NotComputed(&'static str),
}

impl Error {
    /// Negative status code of this error for the integer-code API.
    pub fn code(&self) -> i64 {
        match self {
            Error::InvalidInput(_) => -1,
            Error::ShapeMismatch(_) => -2,
            Error::NotFound(_) => -3,
            Error::ResourceExhausted(_) => -4,
            Error::UnsupportedType { .. } => -5,
            Error::Parse { .. } => -6,
            Error::BitPositionOverflow(_) => -7,
            Error::Corrupt(_) => -8,
            Error::NotComputed(_) => -9,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
