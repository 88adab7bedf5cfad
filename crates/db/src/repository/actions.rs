//! Task action (audit trail) repository functions. Insert and read only.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use super::parse_text;
use crate::{models::TaskAction, DbError};

#[derive(FromRow)]
struct ActionRow {
    id: Uuid,
    task_id: Uuid,
    instance_id: Uuid,
    action_name: String,
    action_type: String,
    effect: String,
    performed_by: String,
    performed_at: DateTime<Utc>,
    comments: Option<String>,
    delegate_to: Option<String>,
    from_stage: String,
    to_stage: Option<String>,
}

impl TryFrom<ActionRow> for TaskAction {
    type Error = DbError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        Ok(TaskAction {
            id: row.id,
            task_id: row.task_id,
            instance_id: row.instance_id,
            action_name: row.action_name,
            action_type: parse_text(&row.action_type)?,
            effect: parse_text(&row.effect)?,
            performed_by: row.performed_by,
            performed_at: row.performed_at,
            comments: row.comments,
            delegate_to: row.delegate_to,
            from_stage: row.from_stage,
            to_stage: row.to_stage,
        })
    }
}

pub async fn append_action<'e>(executor: impl PgExecutor<'e>, action: &TaskAction) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO task_actions
            (id, task_id, instance_id, action_name, action_type, effect,
             performed_by, performed_at, comments, delegate_to, from_stage, to_stage)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(action.id)
    .bind(action.task_id)
    .bind(action.instance_id)
    .bind(&action.action_name)
    .bind(action.action_type.as_str())
    .bind(action.effect.as_str())
    .bind(&action.performed_by)
    .bind(action.performed_at)
    .bind(&action.comments)
    .bind(&action.delegate_to)
    .bind(&action.from_stage)
    .bind(&action.to_stage)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_actions(pool: &PgPool, instance_id: Uuid) -> Result<Vec<TaskAction>, DbError> {
    let rows: Vec<ActionRow> = sqlx::query_as(
        r#"
        SELECT id, task_id, instance_id, action_name, action_type, effect,
               performed_by, performed_at, comments, delegate_to, from_stage, to_stage
        FROM task_actions
        WHERE instance_id = $1
        ORDER BY performed_at ASC
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}
