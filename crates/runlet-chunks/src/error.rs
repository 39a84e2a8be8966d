//! Error types for the runlet protocol crate.

use thiserror::Error;

/// Errors that can occur when encoding or decoding chunks.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A chunk that violates the framing contract
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),
}

impl ProtocolError {
    /// Create a new invalid chunk error.
    pub fn invalid_chunk(msg: impl Into<String>) -> Self {
        Self::InvalidChunk(msg.into())
    }
}
