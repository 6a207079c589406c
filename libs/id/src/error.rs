//! Errors raised while parsing identifiers.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The prefix does not name this identifier type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion failed to decode.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
