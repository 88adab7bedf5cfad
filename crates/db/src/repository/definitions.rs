//! Process definition repository functions.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_text;
use crate::{
    models::{DefinitionRecord, DefinitionStatus},
    DbError,
};

const COLUMNS: &str = "id, name, version, category, status, body, created_at, activated_at";

#[derive(FromRow)]
struct DefinitionRow {
    id: Uuid,
    name: String,
    version: i32,
    category: String,
    status: String,
    body: serde_json::Value,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
}

impl TryFrom<DefinitionRow> for DefinitionRecord {
    type Error = DbError;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        Ok(DefinitionRecord {
            id: row.id,
            name: row.name,
            version: row.version,
            category: row.category,
            status: parse_text(&row.status)?,
            body: row.body,
            created_at: row.created_at,
            activated_at: row.activated_at,
        })
    }
}

/// Insert a new definition version. `(name, version)` is unique.
pub async fn insert_definition(pool: &PgPool, def: &DefinitionRecord) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO process_definitions
            (id, name, version, category, status, body, created_at, activated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(def.id)
    .bind(&def.name)
    .bind(def.version)
    .bind(&def.category)
    .bind(def.status.as_str())
    .bind(&def.body)
    .bind(def.created_at)
    .bind(def.activated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a single definition by its primary key.
pub async fn get_definition(pool: &PgPool, id: Uuid) -> Result<DefinitionRecord, DbError> {
    let row: DefinitionRow = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM process_definitions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("definition", id))?;

    row.try_into()
}

/// All versions of a process name, oldest version first.
pub async fn definitions_by_name(pool: &PgPool, name: &str) -> Result<Vec<DefinitionRecord>, DbError> {
    let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM process_definitions WHERE name = $1 ORDER BY version ASC"
    ))
    .bind(name)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Definitions, optionally restricted to a category.
pub async fn list_definitions(
    pool: &PgPool,
    category: Option<&str>,
) -> Result<Vec<DefinitionRecord>, DbError> {
    let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM process_definitions
        WHERE ($1::TEXT IS NULL OR category = $1)
        ORDER BY name ASC, version ASC
        "#
    ))
    .bind(category)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Update a definition's status.
///
/// The partial unique index `process_definitions_one_active` turns a second
/// active version of the same name into `DbError::Conflict`.
pub async fn set_definition_status(
    pool: &PgPool,
    id: Uuid,
    status: DefinitionStatus,
    at: DateTime<Utc>,
) -> Result<DefinitionRecord, DbError> {
    let activated_at = (status == DefinitionStatus::Active).then_some(at);

    let row: DefinitionRow = sqlx::query_as(&format!(
        r#"
        UPDATE process_definitions
        SET status = $1, activated_at = COALESCE($2, activated_at)
        WHERE id = $3
        RETURNING {COLUMNS}
        "#
    ))
    .bind(status.as_str())
    .bind(activated_at)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("definition", id))?;

    row.try_into()
}
