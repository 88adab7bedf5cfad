//! `integrations` crate: the contracts the engine consumes from external
//! collaborators, plus in-process implementations of them.
//!
//! - [`NotificationChannel`]: email/SMS/push delivery lives outside the engine;
//!   the dispatcher reaches it only through this trait.
//! - [`SnapshotProvider`]: the business-object system (schedules, vacation
//!   requests, …) hands out JSON snapshots for rule validation.

pub mod error;
pub mod traits;
pub mod log_channel;
pub mod mock;

pub use error::{ChannelError, SnapshotError};
pub use traits::{MessageContent, NotificationChannel, SnapshotProvider};
pub use log_channel::LogChannel;
