//! `db` crate: the persistence layer.
//!
//! Provides the record types shared by every crate, the [`WorkflowStore`]
//! trait the engine talks to, an in-memory implementation, and a Postgres
//! implementation built from per-table repository functions.
//! No business logic lives here beyond the two invariants the store must
//! enforce atomically: one `active` definition per process name, and one
//! open task per process instance.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use repository::PgStore;
pub use store::WorkflowStore;
