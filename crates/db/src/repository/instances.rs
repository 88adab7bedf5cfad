//! Process instance repository functions.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_text;
use crate::{
    models::{BusinessObjectRef, InstanceStatus, ProcessInstance},
    DbError,
};

const COLUMNS: &str = r#"
    id, definition_id, process_name, category,
    business_object_type, business_object_id, business_object_name,
    current_stage, stage_index, status, status_reason, violations, variables,
    initiator, started_at, completed_at, version
"#;

#[derive(FromRow)]
struct InstanceRow {
    id: Uuid,
    definition_id: Uuid,
    process_name: String,
    category: String,
    business_object_type: String,
    business_object_id: String,
    business_object_name: String,
    current_stage: String,
    stage_index: i32,
    status: String,
    status_reason: Option<String>,
    violations: serde_json::Value,
    variables: serde_json::Value,
    initiator: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<InstanceRow> for ProcessInstance {
    type Error = DbError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(ProcessInstance {
            id: row.id,
            definition_id: row.definition_id,
            process_name: row.process_name,
            category: row.category,
            business_object: BusinessObjectRef {
                object_type: row.business_object_type,
                object_id: row.business_object_id,
                display_name: row.business_object_name,
            },
            current_stage: row.current_stage,
            stage_index: row.stage_index,
            status: parse_text(&row.status)?,
            status_reason: row.status_reason,
            violations: serde_json::from_value(row.violations)?,
            variables: row.variables,
            initiator: row.initiator,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version,
        })
    }
}

pub async fn insert_instance(pool: &PgPool, inst: &ProcessInstance) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO process_instances
            (id, definition_id, process_name, category,
             business_object_type, business_object_id, business_object_name,
             current_stage, stage_index, status, status_reason, violations, variables,
             initiator, started_at, completed_at, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(inst.id)
    .bind(inst.definition_id)
    .bind(&inst.process_name)
    .bind(&inst.category)
    .bind(&inst.business_object.object_type)
    .bind(&inst.business_object.object_id)
    .bind(&inst.business_object.display_name)
    .bind(&inst.current_stage)
    .bind(inst.stage_index)
    .bind(inst.status.as_str())
    .bind(&inst.status_reason)
    .bind(serde_json::to_value(&inst.violations)?)
    .bind(&inst.variables)
    .bind(&inst.initiator)
    .bind(inst.started_at)
    .bind(inst.completed_at)
    .bind(inst.version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_instance(pool: &PgPool, id: Uuid) -> Result<ProcessInstance, DbError> {
    let row: InstanceRow = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM process_instances WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("instance", id))?;

    row.try_into()
}

/// Compare-and-swap update: only succeeds when the stored version still
/// equals `inst.version`.
pub async fn update_instance(pool: &PgPool, inst: &ProcessInstance) -> Result<ProcessInstance, DbError> {
    let row: Option<InstanceRow> = sqlx::query_as(&format!(
        r#"
        UPDATE process_instances
        SET current_stage = $1, stage_index = $2, status = $3, status_reason = $4,
            violations = $5, variables = $6, completed_at = $7, version = version + 1
        WHERE id = $8 AND version = $9
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&inst.current_stage)
    .bind(inst.stage_index)
    .bind(inst.status.as_str())
    .bind(&inst.status_reason)
    .bind(serde_json::to_value(&inst.violations)?)
    .bind(&inst.variables)
    .bind(inst.completed_at)
    .bind(inst.id)
    .bind(inst.version)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None => {
            // Distinguish a missing row from a lost race.
            get_instance(pool, inst.id).await?;
            Err(DbError::Conflict(format!("instance {} was modified concurrently", inst.id)))
        }
    }
}

pub async fn list_instances(
    pool: &PgPool,
    status: Option<InstanceStatus>,
) -> Result<Vec<ProcessInstance>, DbError> {
    let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM process_instances
        WHERE ($1::TEXT IS NULL OR status = $1)
        ORDER BY started_at ASC
        "#
    ))
    .bind(status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}
