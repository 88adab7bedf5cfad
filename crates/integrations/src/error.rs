//! Collaborator-level error types.

use thiserror::Error;

/// Errors returned by a channel's `send` method.
///
/// The dispatcher treats both variants as a failed attempt; the split only
/// matters for logging.
#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    /// Transient failure (timeout, provider unavailable).
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the message (bad address, blocked recipient).
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Errors returned when fetching a business-object snapshot.
#[derive(Debug, Error, Clone)]
pub enum SnapshotError {
    #[error("business object {object_type}/{object_id} not found")]
    NotFound {
        object_type: String,
        object_id: String,
    },

    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
}
