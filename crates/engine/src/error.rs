//! Engine-level error types.

use db::models::Violation;
use db::DbError;
use thiserror::Error;

/// Errors produced by the registry, the rule validator, the task manager
/// and the state machine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A definition, instance or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is malformed (bad definition, unknown action, missing
    /// delegate target…).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A concurrent writer won, or a uniqueness rule would be broken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The target is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Blocking business rules failed.
    #[error("blocked by {} business rule(s)", .0.len())]
    RuleViolation(Vec<Violation>),

    /// Persistence error from the db crate.
    #[error("storage error: {0}")]
    Storage(DbError),
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => Self::NotFound(format!("{entity} {id}")),
            DbError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Storage(other),
        }
    }
}

impl From<queue::QueueError> for EngineError {
    fn from(err: queue::QueueError) -> Self {
        match err {
            queue::QueueError::Database(db) => db.into(),
        }
    }
}
