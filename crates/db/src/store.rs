//! The storage contract the engine, the dispatcher and the escalation
//! scheduler share.
//!
//! Updates of instances and tasks are compare-and-swap on `version`: the
//! caller passes the record as it read it (with the modifications applied),
//! the store rejects the write with [`DbError::Conflict`] if the stored
//! version moved on, and otherwise returns the record with `version + 1`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{
    DefinitionRecord, DefinitionStatus, InstanceStatus, Notification, ProcessInstance, TaskAction,
    TaskFilter, WorkflowTask,
};
use crate::DbError;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ----- process_definitions -----

    /// Fails `Conflict` if `(name, version)` already exists.
    async fn insert_definition(&self, definition: &DefinitionRecord) -> Result<(), DbError>;

    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRecord, DbError>;

    /// All versions of a process name, ascending by version.
    async fn definitions_by_name(&self, name: &str) -> Result<Vec<DefinitionRecord>, DbError>;

    async fn list_definitions(&self, category: Option<&str>) -> Result<Vec<DefinitionRecord>, DbError>;

    /// Change a definition's status. Setting `Active` fails `Conflict` when
    /// another version of the same name is already active; the check and
    /// the write are atomic.
    async fn set_definition_status(
        &self,
        id: Uuid,
        status: DefinitionStatus,
        at: DateTime<Utc>,
    ) -> Result<DefinitionRecord, DbError>;

    // ----- process_instances -----

    async fn insert_instance(&self, instance: &ProcessInstance) -> Result<(), DbError>;

    async fn get_instance(&self, id: Uuid) -> Result<ProcessInstance, DbError>;

    async fn update_instance(&self, instance: &ProcessInstance) -> Result<ProcessInstance, DbError>;

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<ProcessInstance>, DbError>;

    // ----- workflow_tasks -----

    /// Fails `Conflict` if the instance already has an open task.
    async fn insert_task(&self, task: &WorkflowTask) -> Result<(), DbError>;

    async fn get_task(&self, id: Uuid) -> Result<WorkflowTask, DbError>;

    async fn update_task(&self, task: &WorkflowTask) -> Result<WorkflowTask, DbError>;

    async fn open_task_for_instance(&self, instance_id: Uuid) -> Result<Option<WorkflowTask>, DbError>;

    /// Tasks matching the filter, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, DbError>;

    /// Open tasks whose due date is at or before `cutoff`, earliest due first.
    async fn open_tasks_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowTask>, DbError>;

    // ----- task_actions -----

    async fn append_action(&self, action: &TaskAction) -> Result<(), DbError>;

    /// CAS-update `task` and append `action` atomically: either both are
    /// stored or neither is.
    async fn record_action(&self, task: &WorkflowTask, action: &TaskAction) -> Result<WorkflowTask, DbError>;

    /// Audit trail of an instance in `performed_at` order.
    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<TaskAction>, DbError>;

    // ----- notifications -----

    async fn insert_notification(&self, notification: &Notification) -> Result<(), DbError>;

    async fn get_notification(&self, id: Uuid) -> Result<Notification, DbError>;

    /// Atomically pick up to `limit` pending notifications due at `now` and
    /// push their `next_attempt_at` to `now + lease`, so a concurrent worker
    /// skips them until the lease runs out.
    async fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Notification>, DbError>;

    /// Write back a claimed notification. Rows that are no longer `Pending`
    /// (cancelled while being delivered) are left alone and `false` is
    /// returned.
    async fn update_notification(&self, notification: &Notification) -> Result<bool, DbError>;

    /// Cancel every still-pending notification of a task. Returns how many.
    async fn cancel_task_notifications(&self, task_id: Uuid) -> Result<u64, DbError>;

    async fn list_notifications(&self, instance_id: Uuid) -> Result<Vec<Notification>, DbError>;
}
