//! Error types for the protocol crate.

use crate::messages::ParserAction;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a message.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// A single encoded message exceeds the frame length prefix.
    #[error("message of {len} bytes does not fit in a frame")]
    FrameTooLarge {
        /// Encoded length in bytes.
        len: usize,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }
}

/// Marker produced when incoming bytes cannot be turned into a message.
///
/// Decoding never fails past its boundary: undecodable input becomes a
/// `ParseError` that the connection logs and skips.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{action}: {description}")]
pub struct ParseError {
    /// Classification of the failure.
    pub action: ParserAction,
    /// The undecodable bytes.
    pub raw: Vec<u8>,
    /// Description of the failure.
    pub description: String,
}

impl ParseError {
    /// Creates a parse error.
    pub fn new(action: ParserAction, raw: &[u8], description: impl Into<String>) -> Self {
        Self {
            action,
            raw: raw.to_vec(),
            description: description.into(),
        }
    }
}
