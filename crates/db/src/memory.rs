//! In-memory [`WorkflowStore`] for tests and single-node runs.
//!
//! All tables sit behind one `RwLock` so multi-row checks (active
//! definition per name, open task per instance) are atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    DefinitionRecord, DefinitionStatus, InstanceStatus, Notification, NotificationStatus,
    ProcessInstance, TaskAction, TaskFilter, WorkflowTask,
};
use crate::{DbError, WorkflowStore};

#[derive(Default)]
struct Tables {
    definitions: HashMap<Uuid, DefinitionRecord>,
    instances: HashMap<Uuid, ProcessInstance>,
    tasks: HashMap<Uuid, WorkflowTask>,
    actions: Vec<TaskAction>,
    notifications: HashMap<Uuid, Notification>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_definition(&self, definition: &DefinitionRecord) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        let duplicate = tables
            .definitions
            .values()
            .any(|d| d.name == definition.name && d.version == definition.version);
        if duplicate {
            return Err(DbError::Conflict(format!(
                "definition '{}' version {} already exists",
                definition.name, definition.version
            )));
        }
        tables.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRecord, DbError> {
        self.tables
            .read()
            .await
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("definition", id))
    }

    async fn definitions_by_name(&self, name: &str) -> Result<Vec<DefinitionRecord>, DbError> {
        let tables = self.tables.read().await;
        let mut found: Vec<DefinitionRecord> = tables
            .definitions
            .values()
            .filter(|d| d.name == name)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.version);
        Ok(found)
    }

    async fn list_definitions(&self, category: Option<&str>) -> Result<Vec<DefinitionRecord>, DbError> {
        let tables = self.tables.read().await;
        let mut found: Vec<DefinitionRecord> = tables
            .definitions
            .values()
            .filter(|d| category.map_or(true, |c| d.category == c))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(found)
    }

    async fn set_definition_status(
        &self,
        id: Uuid,
        status: DefinitionStatus,
        at: DateTime<Utc>,
    ) -> Result<DefinitionRecord, DbError> {
        let mut tables = self.tables.write().await;
        let name = tables
            .definitions
            .get(&id)
            .map(|d| d.name.clone())
            .ok_or_else(|| DbError::not_found("definition", id))?;

        if status == DefinitionStatus::Active {
            let other_active = tables.definitions.values().find(|d| {
                d.name == name && d.id != id && d.status == DefinitionStatus::Active
            });
            if let Some(other) = other_active {
                return Err(DbError::Conflict(format!(
                    "'{}' version {} is already active",
                    other.name, other.version
                )));
            }
        }

        let record = tables
            .definitions
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("definition", id))?;
        record.status = status;
        if status == DefinitionStatus::Active {
            record.activated_at = Some(at);
        }
        Ok(record.clone())
    }

    async fn insert_instance(&self, instance: &ProcessInstance) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        if tables.instances.contains_key(&instance.id) {
            return Err(DbError::Conflict(format!("instance {} already exists", instance.id)));
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<ProcessInstance, DbError> {
        self.tables
            .read()
            .await
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("instance", id))
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> Result<ProcessInstance, DbError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| DbError::not_found("instance", instance.id))?;
        if stored.version != instance.version {
            return Err(DbError::Conflict(format!(
                "instance {} was modified concurrently",
                instance.id
            )));
        }
        let mut updated = instance.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<ProcessInstance>, DbError> {
        let tables = self.tables.read().await;
        let mut found: Vec<ProcessInstance> = tables
            .instances
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.started_at);
        Ok(found)
    }

    async fn insert_task(&self, task: &WorkflowTask) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        if task.status.is_open() {
            let open = tables
                .tasks
                .values()
                .any(|t| t.instance_id == task.instance_id && t.status.is_open());
            if open {
                return Err(DbError::Conflict(format!(
                    "instance {} already has an open task",
                    task.instance_id
                )));
            }
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<WorkflowTask, DbError> {
        self.tables
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("task", id))
    }

    async fn update_task(&self, task: &WorkflowTask) -> Result<WorkflowTask, DbError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DbError::not_found("task", task.id))?;
        if stored.version != task.version {
            return Err(DbError::Conflict(format!("task {} was modified concurrently", task.id)));
        }
        let mut updated = task.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn open_task_for_instance(&self, instance_id: Uuid) -> Result<Option<WorkflowTask>, DbError> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .find(|t| t.instance_id == instance_id && t.status.is_open())
            .cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, DbError> {
        let tables = self.tables.read().await;
        let mut found: Vec<WorkflowTask> = tables
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn open_tasks_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowTask>, DbError> {
        let tables = self.tables.read().await;
        let mut found: Vec<WorkflowTask> = tables
            .tasks
            .values()
            .filter(|t| t.status.is_open() && t.due_at <= cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.due_at);
        Ok(found)
    }

    async fn append_action(&self, action: &TaskAction) -> Result<(), DbError> {
        self.tables.write().await.actions.push(action.clone());
        Ok(())
    }

    async fn record_action(&self, task: &WorkflowTask, action: &TaskAction) -> Result<WorkflowTask, DbError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DbError::not_found("task", task.id))?;
        if stored.version != task.version {
            return Err(DbError::Conflict(format!("task {} was modified concurrently", task.id)));
        }
        let mut updated = task.clone();
        updated.version += 1;
        *stored = updated.clone();
        tables.actions.push(action.clone());
        Ok(updated)
    }

    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<TaskAction>, DbError> {
        let tables = self.tables.read().await;
        // Vec preserves insertion order, which is performed_at order.
        Ok(tables
            .actions
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), DbError> {
        self.tables
            .write()
            .await
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Notification, DbError> {
        self.tables
            .read()
            .await
            .notifications
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("notification", id))
    }

    async fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Notification>, DbError> {
        let mut tables = self.tables.write().await;
        let mut due: Vec<&mut Notification> = tables
            .notifications
            .values_mut()
            .filter(|n| n.status == NotificationStatus::Pending && n.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|n| n.created_at);

        let mut claimed = Vec::new();
        for notification in due.into_iter().take(limit) {
            // Hand out the row as it was due; the stored copy is leased.
            claimed.push(notification.clone());
            notification.next_attempt_at = now + lease;
        }
        Ok(claimed)
    }

    async fn update_notification(&self, notification: &Notification) -> Result<bool, DbError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .notifications
            .get_mut(&notification.id)
            .ok_or_else(|| DbError::not_found("notification", notification.id))?;
        if stored.status != NotificationStatus::Pending {
            return Ok(false);
        }
        *stored = notification.clone();
        Ok(true)
    }

    async fn cancel_task_notifications(&self, task_id: Uuid) -> Result<u64, DbError> {
        let mut tables = self.tables.write().await;
        let mut cancelled = 0;
        for notification in tables.notifications.values_mut() {
            if notification.task_id == Some(task_id) && notification.status == NotificationStatus::Pending {
                notification.status = NotificationStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn list_notifications(&self, instance_id: Uuid) -> Result<Vec<Notification>, DbError> {
        let tables = self.tables.read().await;
        let mut found: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.instance_id == Some(instance_id))
            .cloned()
            .collect();
        found.sort_by_key(|n| n.created_at);
        Ok(found)
    }
}
