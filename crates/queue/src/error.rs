//! Queue-level error types.

use integrations::ChannelError;
use thiserror::Error;

/// Errors surfaced to callers of the dispatcher (enqueue, sweep).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}

/// Why a single channel attempt did not deliver.
///
/// Never leaves the dispatcher: it is logged and folded into the
/// notification's `last_error`.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no channel registered under '{0}'")]
    UnknownChannel(String),

    #[error("channel '{channel}' failed: {source}")]
    Channel {
        channel: String,
        #[source]
        source: ChannelError,
    },

    #[error("channel '{0}' accepted the call but delivered nothing")]
    Undeliverable(String),
}
