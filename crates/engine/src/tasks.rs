//! Task Manager: the lifecycle of the single task a stage opens.
//!
//! Every write is compare-and-swap on the task's `version`, so two callers
//! racing on one task cannot both move it; the loser gets
//! [`EngineError::Conflict`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use db::models::{Effect, ProcessInstance, TaskAction, TaskComment, TaskFilter, TaskStatus, WorkflowTask};
use db::WorkflowStore;

use crate::models::Stage;
use crate::EngineError;

/// Cool-down between two escalations of one task when the stage sets none.
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 240;

/// What an action does to the task it is taken on.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub effect: Effect,
    pub performer: String,
    pub comments: Option<String>,
    pub delegate_to: Option<String>,
}

#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn WorkflowStore>,
    default_cooldown_minutes: u32,
}

fn ensure_open(task: &WorkflowTask) -> Result<(), EngineError> {
    if task.status.is_open() {
        Ok(())
    } else {
        Err(EngineError::InvalidState(format!(
            "task {} is {}",
            task.id, task.status
        )))
    }
}

/// The task as it looks after `update`, not yet stored.
///
/// `Hold` keeps it open as `InProgress`, `Reassign` closes it as
/// `Delegated`, every other effect closes it as `Completed`.
fn transition(mut task: WorkflowTask, update: &TaskUpdate, now: DateTime<Utc>) -> Result<WorkflowTask, EngineError> {
    ensure_open(&task)?;

    if let Some(text) = update.comments.as_deref().filter(|c| !c.is_empty()) {
        task.comments.push(TaskComment {
            author: update.performer.clone(),
            text: text.to_string(),
            attachments: Vec::new(),
            created_at: now,
        });
    }

    match update.effect {
        Effect::Hold => {
            task.status = TaskStatus::InProgress;
            task.started_at.get_or_insert(now);
        }
        Effect::Reassign => {
            if update.delegate_to.as_deref().map_or(true, str::is_empty) {
                return Err(EngineError::Validation(
                    "delegating a task needs a delegate target".into(),
                ));
            }
            task.status = TaskStatus::Delegated;
            task.completed_at = Some(now);
        }
        Effect::AdvanceStage | Effect::RewindStage | Effect::Complete => {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
        }
    }
    Ok(task)
}

/// Stage assignee, else `variables.assignees.<role>`, else the role inbox.
fn resolve_assignee(stage: &Stage, variables: &Value) -> Option<String> {
    stage.assignee.clone().or_else(|| {
        variables
            .get("assignees")
            .and_then(|a| a.get(&stage.role))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

impl TaskManager {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            default_cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
        }
    }

    pub fn with_default_cooldown(mut self, minutes: u32) -> Self {
        self.default_cooldown_minutes = minutes;
        self
    }

    /// Open the task of `stage` (at `stage_index`) for `instance`.
    ///
    /// # Errors
    /// [`EngineError::Conflict`] when the instance already has an open task.
    pub async fn open(
        &self,
        instance: &ProcessInstance,
        stage_index: usize,
        stage: &Stage,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        if let Some(open) = self.store.open_task_for_instance(instance.id).await? {
            return Err(EngineError::Conflict(format!(
                "instance {} already has open task {}",
                instance.id, open.id
            )));
        }

        let due_at = now.checked_add_signed(stage.sla()).ok_or_else(|| {
            EngineError::Validation(format!("SLA of stage '{}' puts the due date out of range", stage.name))
        })?;
        let cooldown = stage
            .escalation
            .cooldown_minutes
            .unwrap_or(self.default_cooldown_minutes);
        let escalation_cooldown_minutes = i32::try_from(cooldown).map_err(|_| {
            EngineError::Validation(format!(
                "escalation cool-down of {cooldown} minutes at stage '{}' is out of range",
                stage.name
            ))
        })?;

        let task = WorkflowTask {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            stage_name: stage.name.clone(),
            stage_index: stage_index as i32,
            name: stage.task.name.clone(),
            description: stage.task.description.clone(),
            kind: stage.task.kind.clone(),
            assigned_to: resolve_assignee(stage, &instance.variables),
            assigned_role: stage.role.clone(),
            delegated_from: None,
            status: TaskStatus::Pending,
            permitted_actions: stage.permitted_actions.clone(),
            due_at,
            created_at: now,
            started_at: None,
            completed_at: None,
            comments: Vec::new(),
            escalation_enabled: stage.escalation.enabled,
            escalated_to: stage.escalation.escalate_to.clone(),
            escalation_cooldown_minutes,
            escalation_count: 0,
            last_escalated_at: None,
            reminder_sent: false,
            version: 0,
        };
        self.store.insert_task(&task).await?;
        info!(task_id = %task.id, instance_id = %instance.id, stage = %stage.name, assignee = %task.recipient(), "task opened");
        Ok(task)
    }

    /// Apply an action's effect to a task.
    ///
    /// `Hold` keeps the task open as `InProgress`, `Reassign` closes it as
    /// `Delegated` (see [`reassign`](Self::reassign) for the replacement),
    /// every other effect closes it as `Completed`.
    pub async fn apply(
        &self,
        task_id: Uuid,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        let task = self.get(task_id).await?;
        self.apply_to(task, update, now).await
    }

    pub(crate) async fn apply_to(
        &self,
        task: WorkflowTask,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        let task = transition(task, update, now)?;
        let task = self.store.update_task(&task).await?;
        debug!(task_id = %task.id, status = %task.status, "task updated");
        Ok(task)
    }

    /// Like [`apply_to`](Self::apply_to), storing `action` in the same write.
    /// Nothing is stored when either part fails.
    pub(crate) async fn record(
        &self,
        task: WorkflowTask,
        update: &TaskUpdate,
        action: &TaskAction,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        let task = transition(task, update, now)?;
        let task = self.store.record_action(&task, action).await?;
        debug!(task_id = %task.id, status = %task.status, action = %action.action_name, "action recorded");
        Ok(task)
    }

    /// Open a replacement of a closed task, at the same stage, for `to`.
    /// Escalation counters and comments carry over.
    pub async fn reassign(
        &self,
        closed: &WorkflowTask,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        let task = WorkflowTask {
            id: Uuid::new_v4(),
            assigned_to: Some(to.to_string()),
            delegated_from: Some(closed.recipient()),
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
            ..closed.clone()
        };
        self.store.insert_task(&task).await?;
        info!(task_id = %task.id, from = %closed.recipient(), to, "task reassigned");
        Ok(task)
    }

    /// `Pending -> InProgress`, taking the task out of the role inbox.
    pub async fn claim(&self, task_id: Uuid, actor: &str, now: DateTime<Utc>) -> Result<WorkflowTask, EngineError> {
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "task {} is {} and cannot be claimed",
                task.id, task.status
            )));
        }
        match task.assigned_to.as_deref() {
            Some(owner) if owner != actor => {
                return Err(EngineError::Validation(format!(
                    "task {} is assigned to {owner}",
                    task.id
                )))
            }
            _ => {}
        }
        task.assigned_to = Some(actor.to_string());
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        Ok(self.store.update_task(&task).await?)
    }

    pub async fn comment(
        &self,
        task_id: Uuid,
        author: &str,
        text: &str,
        attachments: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(EngineError::Validation("empty comment".into()));
        }
        let mut task = self.get(task_id).await?;
        ensure_open(&task)?;
        task.comments.push(TaskComment {
            author: author.to_string(),
            text: text.to_string(),
            attachments,
            created_at: now,
        });
        Ok(self.store.update_task(&task).await?)
    }

    /// Close an open task as `Cancelled`.
    pub async fn cancel(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<WorkflowTask, EngineError> {
        let mut task = self.get(task_id).await?;
        ensure_open(&task)?;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);
        Ok(self.store.update_task(&task).await?)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<WorkflowTask, EngineError> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, EngineError> {
        Ok(self.store.list_tasks(filter).await?)
    }

    // ----- escalation bookkeeping -----

    /// Bump the escalation counters of a task that stays where it is.
    pub(crate) async fn record_escalation(
        &self,
        mut task: WorkflowTask,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        ensure_open(&task)?;
        task.escalation_count += 1;
        task.last_escalated_at = Some(now);
        Ok(self.store.update_task(&task).await?)
    }

    /// Close a task as `Escalated` and reopen it for `target`.
    pub(crate) async fn escalate_to(
        &self,
        mut task: WorkflowTask,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        ensure_open(&task)?;
        task.status = TaskStatus::Escalated;
        task.escalation_count += 1;
        task.last_escalated_at = Some(now);
        task.completed_at = Some(now);
        let closed = self.store.update_task(&task).await?;
        self.reassign(&closed, target, now).await
    }

    pub(crate) async fn mark_reminded(&self, mut task: WorkflowTask) -> Result<WorkflowTask, EngineError> {
        task.reminder_sent = true;
        Ok(self.store.update_task(&task).await?)
    }
}
