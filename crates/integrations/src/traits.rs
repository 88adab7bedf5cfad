//! Collaborator traits: the contract every external system must fulfil.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChannelError, SnapshotError};

/// Rendered notification content handed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: String,
    pub body: String,
}

/// A delivery channel (email, SMS, push, chat…).
///
/// `Ok(true)` means the provider accepted the message. `Ok(false)` means the
/// call succeeded but nothing was delivered (e.g. no address on file); the
/// dispatcher moves on to the next channel in both the `Ok(false)` and `Err`
/// cases.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        channel: &str,
        content: &MessageContent,
    ) -> Result<bool, ChannelError>;
}

/// Source of business-object snapshots used by rule validation.
///
/// Implemented by the system that owns the business object; the engine only
/// ever sees the returned JSON.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_snapshot(&self, object_type: &str, object_id: &str) -> Result<Value, SnapshotError>;
}
