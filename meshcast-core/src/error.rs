//! Error types shared across the mesh

use thiserror::Error;

/// Mesh error types
///
/// Chunk ordering anomalies (duplicates, out-of-order arrival) are absorbed by
/// the relay buffers and never show up here, and an empty upstream selection is
/// an empty result rather than an error.
#[derive(Debug, Error)]
pub enum Error {
    /// A relay channel failed to establish or dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// The signaling transport is unreachable or rejected a message
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Frame codec error: {0}")]
    Codec(String),
}

/// Result type for mesh operations
pub type Result<T> = std::result::Result<T, Error>;
