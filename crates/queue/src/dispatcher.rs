//! Notification Dispatcher.
//!
//! 1. `enqueue` renders the content and persists a `pending` row, then nudges
//!    the worker without waiting (a full nudge channel is ignored: the
//!    periodic sweep picks the row up anyway).
//! 2. `deliver_due` claims due rows under a lease and tries each requested
//!    channel in order; the first success marks the row `sent`.
//! 3. A sweep where every channel fails counts as one attempt. The row is
//!    rescheduled with exponential back-off, or marked `failed` once
//!    `max_attempts` is reached. Every row ends `sent`, `failed` or
//!    `cancelled`.
//! 4. Write-backs only touch rows that are still `pending`. A row cancelled
//!    while its send was in flight stays `cancelled`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::models::{Notification, NotificationKind, NotificationStatus};
use db::WorkflowStore;
use integrations::NotificationChannel;

use crate::render::{render, RenderContext};
use crate::{DeliveryError, QueueError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delivery sweeps before a notification is marked failed.
    pub max_attempts: u32,
    /// Base delay for exponential back-off between sweeps of one row.
    pub retry_base_delay: Duration,
    /// How often the worker sweeps without being nudged.
    pub sweep_interval: Duration,
    /// How long a claimed row stays invisible to other workers.
    pub lease: Duration,
    /// Rows claimed per sweep.
    pub batch_size: usize,
    /// Channels used when a request names none.
    pub default_channels: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            lease: Duration::from_secs(60),
            batch_size: 50,
            default_channels: vec!["email".to_string()],
        }
    }
}

impl DispatcherConfig {
    /// delay = retry_base_delay * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Maps channel names (`"email"`, `"sms"`, …) to implementations.
pub type ChannelRegistry = HashMap<String, Arc<dyn NotificationChannel>>;

/// What the engine asks the dispatcher to send.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub instance_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub recipient: String,
    /// Empty means the dispatcher's default channels.
    pub channels: Vec<String>,
    pub context: RenderContext,
    pub body_template: Option<String>,
}

/// Outcome counts of one `deliver_due` sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Cancelled while the send was in flight; the outcome was dropped.
    pub cancelled: usize,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    store: Arc<dyn WorkflowStore>,
    channels: ChannelRegistry,
    config: DispatcherConfig,
    nudge_tx: mpsc::Sender<()>,
    nudge_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn WorkflowStore>, channels: ChannelRegistry, config: DispatcherConfig) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        Self {
            store,
            channels,
            config,
            nudge_tx,
            nudge_rx: Mutex::new(Some(nudge_rx)),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Render and persist a notification. Never talks to a channel.
    #[instrument(skip(self, request), fields(kind = %request.kind, recipient = %request.recipient))]
    pub async fn enqueue(&self, request: NotificationRequest) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let content = render(request.kind, &request.context, request.body_template.as_deref());
        let channels = if request.channels.is_empty() {
            self.config.default_channels.clone()
        } else {
            request.channels
        };

        let notification = Notification {
            id: Uuid::new_v4(),
            instance_id: request.instance_id,
            task_id: request.task_id,
            kind: request.kind,
            recipient: request.recipient,
            channels,
            subject: content.subject,
            body: content.body,
            status: NotificationStatus::Pending,
            attempts: 0,
            max_attempts: i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX),
            next_attempt_at: now,
            last_error: None,
            delivered_via: None,
            created_at: now,
            sent_at: None,
        };
        self.store.insert_notification(&notification).await?;

        // Wake the worker if it is idle; a full buffer already means "wake".
        let _ = self.nudge_tx.try_send(());

        debug!(notification_id = %notification.id, "notification enqueued");
        Ok(notification.id)
    }

    /// Cancel undelivered notifications of a task.
    pub async fn cancel_for_task(&self, task_id: Uuid) -> Result<u64, QueueError> {
        let cancelled = self.store.cancel_task_notifications(task_id).await?;
        if cancelled > 0 {
            info!(%task_id, cancelled, "cancelled pending notifications");
        }
        Ok(cancelled)
    }

    /// Deliver every notification due at `now`.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport, QueueError> {
        let lease = chrono::Duration::from_std(self.config.lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let claimed = self
            .store
            .claim_due_notifications(now, lease, self.config.batch_size)
            .await?;

        let mut report = DeliveryReport::default();
        for notification in claimed {
            let id = notification.id;
            match self.deliver_one(notification, now).await {
                Ok(NotificationStatus::Sent) => report.sent += 1,
                Ok(NotificationStatus::Failed) => report.failed += 1,
                Ok(NotificationStatus::Cancelled) => report.cancelled += 1,
                Ok(_) => report.retrying += 1,
                Err(e) => {
                    // The lease expires and the next sweep retries the row.
                    error!(notification_id = %id, "could not record delivery outcome: {e}");
                }
            }
        }
        Ok(report)
    }

    async fn deliver_one(&self, mut notification: Notification, now: DateTime<Utc>) -> Result<NotificationStatus, QueueError> {
        let content = integrations::MessageContent {
            subject: notification.subject.clone(),
            body: notification.body.clone(),
        };

        let mut last_error: Option<DeliveryError> = None;
        for channel_name in &notification.channels {
            match self.try_channel(channel_name, &notification.recipient, &content).await {
                Ok(()) => {
                    notification.status = NotificationStatus::Sent;
                    notification.delivered_via = Some(channel_name.clone());
                    notification.sent_at = Some(now);
                    notification.attempts += 1;
                    notification.last_error = None;
                    if !self.write_back(&notification).await? {
                        return Ok(NotificationStatus::Cancelled);
                    }
                    info!(
                        notification_id = %notification.id,
                        channel = %channel_name,
                        recipient = %notification.recipient,
                        "notification sent"
                    );
                    return Ok(NotificationStatus::Sent);
                }
                Err(e) => {
                    warn!(notification_id = %notification.id, "{e}");
                    last_error = Some(e);
                }
            }
        }

        notification.attempts += 1;
        notification.last_error = Some(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no channels requested".to_string()),
        );

        if notification.attempts >= notification.max_attempts {
            notification.status = NotificationStatus::Failed;
            error!(
                notification_id = %notification.id,
                attempts = notification.attempts,
                "notification delivery failed permanently: {}",
                notification.last_error.as_deref().unwrap_or_default()
            );
        } else {
            let attempt = u32::try_from(notification.attempts).unwrap_or(u32::MAX);
            let delay = self.config.delay_for_attempt(attempt);
            notification.next_attempt_at =
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));
            warn!(
                notification_id = %notification.id,
                attempt = notification.attempts,
                max_attempts = notification.max_attempts,
                "delivery failed, retrying in {delay:?}"
            );
        }

        if !self.write_back(&notification).await? {
            return Ok(NotificationStatus::Cancelled);
        }
        Ok(notification.status)
    }

    async fn write_back(&self, notification: &Notification) -> Result<bool, QueueError> {
        let written = self.store.update_notification(notification).await?;
        if !written {
            debug!(notification_id = %notification.id, "notification cancelled during delivery, outcome dropped");
        }
        Ok(written)
    }

    async fn try_channel(
        &self,
        channel_name: &str,
        recipient: &str,
        content: &integrations::MessageContent,
    ) -> Result<(), DeliveryError> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| DeliveryError::UnknownChannel(channel_name.to_owned()))?;

        match channel.send(recipient, channel_name, content).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryError::Undeliverable(channel_name.to_owned())),
            Err(source) => Err(DeliveryError::Channel {
                channel: channel_name.to_owned(),
                source,
            }),
        }
    }

    /// Background worker: sweep on every tick or nudge until `shutdown`
    /// flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut nudges = self.nudge_rx.lock().ok().and_then(|mut rx| rx.take());
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        info!("notification dispatcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = recv_nudge(&mut nudges) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            match self.deliver_due(Utc::now()).await {
                Ok(report) if report != DeliveryReport::default() => {
                    debug!(?report, "delivery sweep finished");
                }
                Ok(_) => {}
                Err(e) => error!("delivery sweep failed: {e}"),
            }
        }

        info!("notification dispatcher stopped");
    }
}

async fn recv_nudge(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
