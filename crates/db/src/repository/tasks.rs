//! Workflow task repository functions.
//!
//! The partial unique index `workflow_tasks_one_open` enforces the
//! single-active-task invariant; updates are compare-and-swap on `version`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use super::{actions, parse_text};
use crate::{
    models::{TaskAction, TaskFilter, WorkflowTask},
    DbError,
};

const COLUMNS: &str = r#"
    id, instance_id, stage_name, stage_index, name, description, kind,
    assigned_to, assigned_role, delegated_from, status, permitted_actions,
    due_at, created_at, started_at, completed_at, comments,
    escalation_enabled, escalated_to, escalation_cooldown_minutes,
    escalation_count, last_escalated_at, reminder_sent, version
"#;

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    instance_id: Uuid,
    stage_name: String,
    stage_index: i32,
    name: String,
    description: String,
    kind: String,
    assigned_to: Option<String>,
    assigned_role: String,
    delegated_from: Option<String>,
    status: String,
    permitted_actions: Vec<String>,
    due_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    comments: serde_json::Value,
    escalation_enabled: bool,
    escalated_to: Option<String>,
    escalation_cooldown_minutes: i32,
    escalation_count: i32,
    last_escalated_at: Option<DateTime<Utc>>,
    reminder_sent: bool,
    version: i64,
}

impl TryFrom<TaskRow> for WorkflowTask {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(WorkflowTask {
            id: row.id,
            instance_id: row.instance_id,
            stage_name: row.stage_name,
            stage_index: row.stage_index,
            name: row.name,
            description: row.description,
            kind: row.kind,
            assigned_to: row.assigned_to,
            assigned_role: row.assigned_role,
            delegated_from: row.delegated_from,
            status: parse_text(&row.status)?,
            permitted_actions: row.permitted_actions,
            due_at: row.due_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            comments: serde_json::from_value(row.comments)?,
            escalation_enabled: row.escalation_enabled,
            escalated_to: row.escalated_to,
            escalation_cooldown_minutes: row.escalation_cooldown_minutes,
            escalation_count: row.escalation_count,
            last_escalated_at: row.last_escalated_at,
            reminder_sent: row.reminder_sent,
            version: row.version,
        })
    }
}

pub async fn insert_task(pool: &PgPool, task: &WorkflowTask) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_tasks
            (id, instance_id, stage_name, stage_index, name, description, kind,
             assigned_to, assigned_role, delegated_from, status, permitted_actions,
             due_at, created_at, started_at, completed_at, comments,
             escalation_enabled, escalated_to, escalation_cooldown_minutes,
             escalation_count, last_escalated_at, reminder_sent, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
        "#,
    )
    .bind(task.id)
    .bind(task.instance_id)
    .bind(&task.stage_name)
    .bind(task.stage_index)
    .bind(&task.name)
    .bind(&task.description)
    .bind(&task.kind)
    .bind(&task.assigned_to)
    .bind(&task.assigned_role)
    .bind(&task.delegated_from)
    .bind(task.status.as_str())
    .bind(&task.permitted_actions)
    .bind(task.due_at)
    .bind(task.created_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(serde_json::to_value(&task.comments)?)
    .bind(task.escalation_enabled)
    .bind(&task.escalated_to)
    .bind(task.escalation_cooldown_minutes)
    .bind(task.escalation_count)
    .bind(task.last_escalated_at)
    .bind(task.reminder_sent)
    .bind(task.version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<WorkflowTask, DbError> {
    let row: TaskRow = sqlx::query_as(&format!("SELECT {COLUMNS} FROM workflow_tasks WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("task", id))?;

    row.try_into()
}

/// Compare-and-swap update on `version`.
pub async fn update_task(pool: &PgPool, task: &WorkflowTask) -> Result<WorkflowTask, DbError> {
    match try_update_task(pool, task).await? {
        Some(updated) => Ok(updated),
        None => {
            get_task(pool, task.id).await?;
            Err(DbError::Conflict(format!("task {} was modified concurrently", task.id)))
        }
    }
}

/// Task update and audit record in one transaction.
pub async fn record_action(pool: &PgPool, task: &WorkflowTask, action: &TaskAction) -> Result<WorkflowTask, DbError> {
    let mut tx = pool.begin().await?;
    let Some(updated) = try_update_task(&mut *tx, task).await? else {
        tx.rollback().await?;
        get_task(pool, task.id).await?;
        return Err(DbError::Conflict(format!("task {} was modified concurrently", task.id)));
    };
    actions::append_action(&mut *tx, action).await?;
    tx.commit().await?;
    Ok(updated)
}

/// The CAS write itself; `None` when the id/version pair did not match.
async fn try_update_task<'e>(
    executor: impl PgExecutor<'e>,
    task: &WorkflowTask,
) -> Result<Option<WorkflowTask>, DbError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
        r#"
        UPDATE workflow_tasks
        SET assigned_to = $1, delegated_from = $2, status = $3, due_at = $4,
            started_at = $5, completed_at = $6, comments = $7, escalated_to = $8,
            escalation_count = $9, last_escalated_at = $10, reminder_sent = $11,
            version = version + 1
        WHERE id = $12 AND version = $13
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&task.assigned_to)
    .bind(&task.delegated_from)
    .bind(task.status.as_str())
    .bind(task.due_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(serde_json::to_value(&task.comments)?)
    .bind(&task.escalated_to)
    .bind(task.escalation_count)
    .bind(task.last_escalated_at)
    .bind(task.reminder_sent)
    .bind(task.id)
    .bind(task.version)
    .fetch_optional(executor)
    .await?;

    row.map(TryInto::try_into).transpose()
}

pub async fn open_task_for_instance(pool: &PgPool, instance_id: Uuid) -> Result<Option<WorkflowTask>, DbError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM workflow_tasks
        WHERE instance_id = $1 AND status IN ('pending', 'in_progress')
        "#
    ))
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;

    row.map(TryInto::try_into).transpose()
}

pub async fn list_tasks(pool: &PgPool, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, DbError> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM workflow_tasks
        WHERE ($1::TEXT IS NULL OR assigned_to = $1)
          AND ($2::TEXT IS NULL OR status = $2)
          AND ($3::UUID IS NULL OR instance_id = $3)
        ORDER BY created_at ASC
        "#
    ))
    .bind(filter.assignee.as_deref())
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.instance_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Open tasks due at or before `cutoff`, for the escalation scan.
pub async fn open_tasks_due_before(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowTask>, DbError> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM workflow_tasks
        WHERE status IN ('pending', 'in_progress') AND due_at <= $1
        ORDER BY due_at ASC
        "#
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}
