//! `queue` crate: the notification outbox and its delivery worker.
//!
//! Notifications are persisted as `pending` rows by [`Dispatcher::enqueue`]
//! (which never waits on a channel) and delivered by
//! [`Dispatcher::deliver_due`], driven either by a background worker
//! ([`Dispatcher::run`]) or directly in tests.

pub mod dispatcher;
pub mod error;
pub mod render;

pub use dispatcher::{ChannelRegistry, DeliveryReport, Dispatcher, DispatcherConfig, NotificationRequest};
pub use error::{DeliveryError, QueueError};
pub use render::{render, RenderContext};
