//! Notification outbox repository functions.
//!
//! Dispatcher workers claim due rows with `SELECT … FOR UPDATE SKIP LOCKED`
//! and push `next_attempt_at` forward by a lease inside the same
//! transaction, so concurrent workers never send a notification twice.

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_text;
use crate::{models::Notification, DbError};

const COLUMNS: &str = r#"
    id, instance_id, task_id, kind, recipient, channels, subject, body, status,
    attempts, max_attempts, next_attempt_at, last_error, delivered_via,
    created_at, sent_at
"#;

#[derive(FromRow)]
struct NotificationRow {
    id: Uuid,
    instance_id: Option<Uuid>,
    task_id: Option<Uuid>,
    kind: String,
    recipient: String,
    channels: Vec<String>,
    subject: String,
    body: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    delivered_via: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = DbError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            instance_id: row.instance_id,
            task_id: row.task_id,
            kind: parse_text(&row.kind)?,
            recipient: row.recipient,
            channels: row.channels,
            subject: row.subject,
            body: row.body,
            status: parse_text(&row.status)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            delivered_via: row.delivered_via,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

pub async fn insert_notification(pool: &PgPool, n: &Notification) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO notifications
            (id, instance_id, task_id, kind, recipient, channels, subject, body, status,
             attempts, max_attempts, next_attempt_at, last_error, delivered_via,
             created_at, sent_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(n.id)
    .bind(n.instance_id)
    .bind(n.task_id)
    .bind(n.kind.as_str())
    .bind(&n.recipient)
    .bind(&n.channels)
    .bind(&n.subject)
    .bind(&n.body)
    .bind(n.status.as_str())
    .bind(n.attempts)
    .bind(n.max_attempts)
    .bind(n.next_attempt_at)
    .bind(&n.last_error)
    .bind(&n.delivered_via)
    .bind(n.created_at)
    .bind(n.sent_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_notification(pool: &PgPool, id: Uuid) -> Result<Notification, DbError> {
    let row: NotificationRow = sqlx::query_as(&format!("SELECT {COLUMNS} FROM notifications WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("notification", id))?;

    row.try_into()
}

/// Atomically claim up to `limit` due pending notifications.
pub async fn claim_due_notifications(
    pool: &PgPool,
    now: DateTime<Utc>,
    lease: Duration,
    limit: usize,
) -> Result<Vec<Notification>, DbError> {
    let mut tx = pool.begin().await?;

    let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM notifications
        WHERE status = 'pending' AND next_attempt_at <= $1
        ORDER BY created_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .bind(now)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(&mut *tx)
    .await?;

    if rows.is_empty() {
        tx.rollback().await?;
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    sqlx::query("UPDATE notifications SET next_attempt_at = $1 WHERE id = ANY($2)")
        .bind(now + lease)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Write back a claimed row. Only rows still `pending` are touched, so a
/// cancellation that landed mid-delivery wins; returns whether it was written.
pub async fn update_notification(pool: &PgPool, n: &Notification) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE notifications
        SET status = $1, attempts = $2, next_attempt_at = $3, last_error = $4,
            delivered_via = $5, sent_at = $6, subject = $7, body = $8
        WHERE id = $9 AND status = 'pending'
        "#,
    )
    .bind(n.status.as_str())
    .bind(n.attempts)
    .bind(n.next_attempt_at)
    .bind(&n.last_error)
    .bind(&n.delivered_via)
    .bind(n.sent_at)
    .bind(&n.subject)
    .bind(&n.body)
    .bind(n.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        get_notification(pool, n.id).await?;
        return Ok(false);
    }
    Ok(true)
}

/// Cancel still-pending notifications of a task; delivered ones stay as-is.
pub async fn cancel_task_notifications(pool: &PgPool, task_id: Uuid) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE notifications SET status = 'cancelled' WHERE task_id = $1 AND status = 'pending'",
    )
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_notifications(pool: &PgPool, instance_id: Uuid) -> Result<Vec<Notification>, DbError> {
    let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM notifications WHERE instance_id = $1 ORDER BY created_at ASC"
    ))
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TryInto::try_into).collect()
}
