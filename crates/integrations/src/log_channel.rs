//! `LogChannel` writes notifications to the tracing log instead of an
//! external provider. Used by single-node deployments and demos.

use async_trait::async_trait;
use tracing::info;

use crate::{ChannelError, MessageContent, NotificationChannel};

#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(
        &self,
        recipient: &str,
        channel: &str,
        content: &MessageContent,
    ) -> Result<bool, ChannelError> {
        info!(
            recipient,
            channel,
            subject = %content.subject,
            "notification: {}",
            content.body
        );
        Ok(true)
    }
}
