//! Error types for offline storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored snapshot could not be decoded.
    #[error("snapshot for {name} is corrupted: {reason}")]
    Corrupted {
        /// Record name of the snapshot.
        name: String,
        /// Why decoding failed.
        reason: String,
    },

    /// A snapshot could not be encoded.
    #[error("snapshot for {name} could not be encoded: {reason}")]
    Encoding {
        /// Record name of the snapshot.
        name: String,
        /// Why encoding failed.
        reason: String,
    },

    /// The record name cannot be used as a storage key.
    #[error("invalid record name: {0:?}")]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StorageError::Corrupted {
            name: "user/1".into(),
            reason: "eof".into(),
        };
        assert_eq!(err.to_string(), "snapshot for user/1 is corrupted: eof");
        assert_eq!(
            StorageError::InvalidName(String::new()).to_string(),
            "invalid record name: \"\""
        );
    }
}
