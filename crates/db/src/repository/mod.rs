//! Repository functions, one per database operation, and
//! [`PgStore`], the [`WorkflowStore`] implementation built from them.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Pure SQL, no orchestration.

pub mod actions;
pub mod definitions;
pub mod instances;
pub mod notifications;
pub mod tasks;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{
    DefinitionRecord, DefinitionStatus, InstanceStatus, Notification, ProcessInstance, TaskAction,
    TaskFilter, WorkflowTask,
};
use crate::{DbError, DbPool, WorkflowStore};

/// Decode a text column into one of the status enums.
pub(crate) fn parse_text<T: FromStr<Err = String>>(value: &str) -> Result<T, DbError> {
    value.parse().map_err(DbError::Corrupt)
}

/// Postgres-backed [`WorkflowStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn insert_definition(&self, definition: &DefinitionRecord) -> Result<(), DbError> {
        definitions::insert_definition(&self.pool, definition).await
    }

    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRecord, DbError> {
        definitions::get_definition(&self.pool, id).await
    }

    async fn definitions_by_name(&self, name: &str) -> Result<Vec<DefinitionRecord>, DbError> {
        definitions::definitions_by_name(&self.pool, name).await
    }

    async fn list_definitions(&self, category: Option<&str>) -> Result<Vec<DefinitionRecord>, DbError> {
        definitions::list_definitions(&self.pool, category).await
    }

    async fn set_definition_status(
        &self,
        id: Uuid,
        status: DefinitionStatus,
        at: DateTime<Utc>,
    ) -> Result<DefinitionRecord, DbError> {
        definitions::set_definition_status(&self.pool, id, status, at).await
    }

    async fn insert_instance(&self, instance: &ProcessInstance) -> Result<(), DbError> {
        instances::insert_instance(&self.pool, instance).await
    }

    async fn get_instance(&self, id: Uuid) -> Result<ProcessInstance, DbError> {
        instances::get_instance(&self.pool, id).await
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> Result<ProcessInstance, DbError> {
        instances::update_instance(&self.pool, instance).await
    }

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<ProcessInstance>, DbError> {
        instances::list_instances(&self.pool, status).await
    }

    async fn insert_task(&self, task: &WorkflowTask) -> Result<(), DbError> {
        tasks::insert_task(&self.pool, task).await
    }

    async fn get_task(&self, id: Uuid) -> Result<WorkflowTask, DbError> {
        tasks::get_task(&self.pool, id).await
    }

    async fn update_task(&self, task: &WorkflowTask) -> Result<WorkflowTask, DbError> {
        tasks::update_task(&self.pool, task).await
    }

    async fn open_task_for_instance(&self, instance_id: Uuid) -> Result<Option<WorkflowTask>, DbError> {
        tasks::open_task_for_instance(&self.pool, instance_id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, DbError> {
        tasks::list_tasks(&self.pool, filter).await
    }

    async fn open_tasks_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowTask>, DbError> {
        tasks::open_tasks_due_before(&self.pool, cutoff).await
    }

    async fn append_action(&self, action: &TaskAction) -> Result<(), DbError> {
        actions::append_action(&self.pool, action).await
    }

    async fn record_action(&self, task: &WorkflowTask, action: &TaskAction) -> Result<WorkflowTask, DbError> {
        tasks::record_action(&self.pool, task, action).await
    }

    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<TaskAction>, DbError> {
        actions::list_actions(&self.pool, instance_id).await
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), DbError> {
        notifications::insert_notification(&self.pool, notification).await
    }

    async fn get_notification(&self, id: Uuid) -> Result<Notification, DbError> {
        notifications::get_notification(&self.pool, id).await
    }

    async fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Notification>, DbError> {
        notifications::claim_due_notifications(&self.pool, now, lease, limit).await
    }

    async fn update_notification(&self, notification: &Notification) -> Result<bool, DbError> {
        notifications::update_notification(&self.pool, notification).await
    }

    async fn cancel_task_notifications(&self, task_id: Uuid) -> Result<u64, DbError> {
        notifications::cancel_task_notifications(&self.pool, task_id).await
    }

    async fn list_notifications(&self, instance_id: Uuid) -> Result<Vec<Notification>, DbError> {
        notifications::list_notifications(&self.pool, instance_id).await
    }
}
