//! ID parse errors.

use thiserror::Error;

/// Why a string is not a valid ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// Well-formed, but names a different kind of object.
    #[error("ID prefix mismatch: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID has no '_' between prefix and ULID")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the input was an ID of another kind, e.g. a tick id where a
    /// node id was expected.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
