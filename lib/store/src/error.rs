//! Error types for the store crate.

use std::fmt;

/// Errors from local persistence.
///
/// These never end a session: the store logs them and carries on with
/// in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Reading a key failed.
    ReadFailed { key: String, reason: String },
    /// Writing a key failed.
    WriteFailed { key: String, reason: String },
    /// The stored value could not be decoded.
    Corrupt { key: String, reason: String },
    /// The record could not be encoded.
    EncodeFailed { key: String, reason: String },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { key, reason } => {
                write!(f, "failed to read '{key}': {reason}")
            }
            Self::WriteFailed { key, reason } => {
                write!(f, "failed to write '{key}': {reason}")
            }
            Self::Corrupt { key, reason } => {
                write!(f, "stored value for '{key}' is corrupt: {reason}")
            }
            Self::EncodeFailed { key, reason } => {
                write!(f, "failed to encode value for '{key}': {reason}")
            }
        }
    }
}

impl std::error::Error for PersistenceError {}
