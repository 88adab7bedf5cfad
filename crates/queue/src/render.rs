//! Notification rendering.
//!
//! Templates are plain strings with `{placeholder}` markers: `{process}`,
//! `{task}`, `{stage}`, `{object}`, `{recipient}`, `{due}` and `{detail}`.
//! Markers are substituted in one pass, so text inside a substituted value
//! is never expanded again; unknown markers are kept as written. Built-in
//! templates exist for every kind; a process definition may override the
//! body per kind.

use chrono::{DateTime, Utc};
use db::models::NotificationKind;
use integrations::MessageContent;

/// Values available to templates.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub process: String,
    pub task: String,
    pub stage: String,
    /// Display name of the business object.
    pub object: String,
    pub recipient: String,
    pub due: Option<DateTime<Utc>>,
    /// Free text (rule violations, outcome). Goes where the body template
    /// puts `{detail}`, or after the body when it has no such marker.
    pub detail: Option<String>,
}

fn default_subject(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Assigned => "[{process}] New task: {task}",
        NotificationKind::Due => "[{process}] Task due soon: {task}",
        NotificationKind::Overdue => "[{process}] Task overdue: {task}",
        NotificationKind::Completed => "[{process}] Process finished: {object}",
        NotificationKind::Escalated => "[{process}] Escalation: {object}",
    }
}

fn default_body(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Assigned => {
            "Hello {recipient}, the task '{task}' at stage '{stage}' for {object} is waiting for you. Due: {due}."
        }
        NotificationKind::Due => "Reminder: the task '{task}' for {object} is due at {due}.",
        NotificationKind::Overdue => "The task '{task}' for {object} passed its due date ({due}).",
        NotificationKind::Completed => "The process for {object} has finished at stage '{stage}'.",
        NotificationKind::Escalated => {
            "The process for {object} needs your attention at stage '{stage}'."
        }
    }
}

fn lookup<'a>(key: &str, ctx: &'a RenderContext, due: &'a str) -> Option<&'a str> {
    match key {
        "process" => Some(ctx.process.as_str()),
        "task" => Some(ctx.task.as_str()),
        "stage" => Some(ctx.stage.as_str()),
        "object" => Some(ctx.object.as_str()),
        "recipient" => Some(ctx.recipient.as_str()),
        "due" => Some(due),
        "detail" => Some(ctx.detail.as_deref().unwrap_or_default()),
        _ => None,
    }
}

fn fill(template: &str, ctx: &RenderContext) -> String {
    let due = ctx
        .due
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "n/a".to_string());

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];
        let Some(close) = rest.find('}') else {
            break;
        };
        match lookup(&rest[1..close], ctx, &due) {
            Some(value) => {
                out.push_str(value);
                rest = &rest[close + 1..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render subject and body for `kind`, using `body_override` when the
/// process definition supplies one.
pub fn render(kind: NotificationKind, ctx: &RenderContext, body_override: Option<&str>) -> MessageContent {
    let template = body_override.unwrap_or(default_body(kind));
    let mut body = fill(template, ctx);
    if let Some(detail) = ctx.detail.as_deref().filter(|_| !template.contains("{detail}")) {
        body.push_str("\n\n");
        body.push_str(detail);
    }

    MessageContent {
        subject: fill(default_subject(kind), ctx),
        body,
    }
}
