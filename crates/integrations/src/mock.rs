//! Test doubles for the collaborator traits.
//!
//! `MockChannel` records every message it receives and fails on demand;
//! `StaticSnapshots` serves business-object snapshots from an in-memory map.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{ChannelError, MessageContent, NotificationChannel, SnapshotError, SnapshotProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Behaviour injected into `MockChannel` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Accept every message.
    Deliver,
    /// Fail the first `n` calls with `Unavailable`, then accept.
    FailTimes(usize),
    /// Always fail with `Unavailable`.
    AlwaysFail,
    /// Return `Ok(false)`: reachable provider, nothing delivered.
    Undeliverable,
}

/// One message seen by a `MockChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub channel: String,
    pub content: MessageContent,
}

/// A mock channel that records every call it receives.
#[derive(Clone)]
pub struct MockChannel {
    pub behaviour: MockBehaviour,
    /// Every call, delivered or not, in call order.
    pub calls: Arc<Mutex<Vec<SentMessage>>>,
}

impl MockChannel {
    pub fn delivering() -> Self {
        Self::with_behaviour(MockBehaviour::Deliver)
    }

    pub fn failing() -> Self {
        Self::with_behaviour(MockBehaviour::AlwaysFail)
    }

    pub fn failing_times(n: usize) -> Self {
        Self::with_behaviour(MockBehaviour::FailTimes(n))
    }

    pub fn undeliverable() -> Self {
        Self::with_behaviour(MockBehaviour::Undeliverable)
    }

    pub fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times `send` has been called.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Snapshot of every call so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl NotificationChannel for MockChannel {
    async fn send(
        &self,
        recipient: &str,
        channel: &str,
        content: &MessageContent,
    ) -> Result<bool, ChannelError> {
        let attempt = {
            let mut calls = lock(&self.calls);
            calls.push(SentMessage {
                recipient: recipient.to_owned(),
                channel: channel.to_owned(),
                content: content.clone(),
            });
            calls.len()
        };

        match self.behaviour {
            MockBehaviour::Deliver => Ok(true),
            MockBehaviour::FailTimes(n) if attempt <= n => {
                Err(ChannelError::Unavailable(format!("mock failure {attempt}/{n}")))
            }
            MockBehaviour::FailTimes(_) => Ok(true),
            MockBehaviour::AlwaysFail => Err(ChannelError::Unavailable("mock channel down".into())),
            MockBehaviour::Undeliverable => Ok(false),
        }
    }
}

/// Snapshot provider backed by a map keyed on `(object_type, object_id)`.
#[derive(Clone, Default)]
pub struct StaticSnapshots {
    objects: Arc<Mutex<HashMap<(String, String), Value>>>,
}

impl StaticSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for a business object.
    pub fn set(&self, object_type: &str, object_id: &str, snapshot: Value) {
        lock(&self.objects)
            .insert((object_type.to_owned(), object_id.to_owned()), snapshot);
    }

    pub fn remove(&self, object_type: &str, object_id: &str) {
        lock(&self.objects)
            .remove(&(object_type.to_owned(), object_id.to_owned()));
    }
}

#[async_trait]
impl SnapshotProvider for StaticSnapshots {
    async fn get_snapshot(&self, object_type: &str, object_id: &str) -> Result<Value, SnapshotError> {
        lock(&self.objects)
            .get(&(object_type.to_owned(), object_id.to_owned()))
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound {
                object_type: object_type.to_owned(),
                object_id: object_id.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content() -> MessageContent {
        MessageContent {
            subject: "Task assigned".into(),
            body: "Please review".into(),
        }
    }

    #[tokio::test]
    async fn failing_times_recovers_after_n_calls() {
        let channel = MockChannel::failing_times(2);
        assert!(channel.send("bob", "email", &content()).await.is_err());
        assert!(channel.send("bob", "email", &content()).await.is_err());
        assert!(channel.send("bob", "email", &content()).await.unwrap());
        assert_eq!(channel.call_count(), 3);
    }

    #[tokio::test]
    async fn records_recipient_and_channel() {
        let channel = MockChannel::delivering();
        channel.send("carol", "sms", &content()).await.unwrap();
        let sent = channel.sent();
        assert_eq!(sent[0].recipient, "carol");
        assert_eq!(sent[0].channel, "sms");
    }

    #[tokio::test]
    async fn static_snapshots_round_trip_and_missing() {
        let snapshots = StaticSnapshots::new();
        snapshots.set("vacation_request", "42", json!({ "days": 3 }));

        let snap = snapshots.get_snapshot("vacation_request", "42").await.unwrap();
        assert_eq!(snap["days"], 3);

        snapshots.remove("vacation_request", "42");
        assert!(matches!(
            snapshots.get_snapshot("vacation_request", "42").await,
            Err(SnapshotError::NotFound { .. })
        ));
    }
}
