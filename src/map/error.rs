//! Error types for the replicated map.

use crate::transport::TransportError;

/// Errors produced by replicated map operations.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The map was shut down and no longer accepts operations.
    #[error("replicated map has been destroyed")]
    Destroyed,

    /// Join-time handshake or state transfer failed and the map is configured
    /// to terminate on startup failure.
    #[error("unable to start replicated map {map}: {reason}")]
    Startup { map: String, reason: String },

    /// A request or send through the transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A key, value or message bundle could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A message arrived without a field its kind requires.
    #[error("message is missing its {0}")]
    MissingField(&'static str),

    /// Applying an incremental delta to a value failed. The value is unchanged.
    #[error("unable to apply diff: {0}")]
    Diff(String),
}
