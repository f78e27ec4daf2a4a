//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding an [`Envelope`](crate::Envelope).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame was not valid JSON or did not match the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame parsed but carried an empty `type`.
    #[error("envelope has an empty type")]
    EmptyType,
    /// The frame was not valid UTF-8.
    #[error("envelope is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
