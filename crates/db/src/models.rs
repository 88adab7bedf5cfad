//! Records that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: plain data with the status enums their
//! columns hold. Orchestration behaviour lives in the `engine` crate; the
//! typed stage list of a definition lives there too and is stored here as
//! JSON in [`DefinitionRecord::body`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Declares a status-like enum stored as lower-case text.
///
/// Generates `as_str`, `Display`, `FromStr` (text form) and `from_name`
/// (variant name, as used in API payloads and definition files).
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse the variant name (`"Approve"`, `"InProgress"`…).
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($variant) => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// process_definitions
// ---------------------------------------------------------------------------

text_enum! {
    /// Lifecycle of a process definition version.
    pub enum DefinitionStatus {
        Draft => "draft",
        Active => "active",
        Suspended => "suspended",
        Deprecated => "deprecated",
    }
}

/// A persisted process definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionRecord {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub category: String,
    pub status: DefinitionStatus,
    /// Stages, roles, rule names and notification policy as JSON.
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// process_instances
// ---------------------------------------------------------------------------

text_enum! {
    pub enum InstanceStatus {
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
        Failed => "failed",
        Suspended => "suspended",
    }
}

impl InstanceStatus {
    /// `Completed`, `Cancelled` and `Failed` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Reference to the external business object a process is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessObjectRef {
    pub object_type: String,
    pub object_id: String,
    pub display_name: String,
}

/// One failed business rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule: String,
    pub rule_version: u32,
    pub priority: i32,
    pub blocking: bool,
    pub message: String,
}

/// A persisted process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub process_name: String,
    pub category: String,
    pub business_object: BusinessObjectRef,
    pub current_stage: String,
    /// Zero-based ordinal of `current_stage` in the bound definition.
    pub stage_index: i32,
    pub status: InstanceStatus,
    pub status_reason: Option<String>,
    /// Blocking violations that suspended the instance (empty otherwise).
    pub violations: Vec<Violation>,
    /// Free-form process variables (always a JSON object).
    pub variables: Value,
    pub initiator: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter, bumped by every update.
    pub version: i64,
}

// ---------------------------------------------------------------------------
// workflow_tasks
// ---------------------------------------------------------------------------

text_enum! {
    pub enum TaskStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        Delegated => "delegated",
        Escalated => "escalated",
    }
}

impl TaskStatus {
    /// `Pending` and `InProgress` are the only actionable states.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// A comment left on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComment {
    pub author: String,
    pub text: String,
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted workflow task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub stage_name: String,
    pub stage_index: i32,
    pub name: String,
    pub description: String,
    pub kind: String,
    /// `None` while the task sits in the role inbox.
    pub assigned_to: Option<String>,
    pub assigned_role: String,
    pub delegated_from: Option<String>,
    pub status: TaskStatus,
    pub permitted_actions: Vec<String>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub comments: Vec<TaskComment>,
    pub escalation_enabled: bool,
    pub escalated_to: Option<String>,
    pub escalation_cooldown_minutes: i32,
    pub escalation_count: i32,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
    /// Optimistic-concurrency counter, bumped by every update.
    pub version: i64,
}

impl WorkflowTask {
    /// Who should hear about this task: the assignee, or the role inbox.
    pub fn recipient(&self) -> String {
        match &self.assigned_to {
            Some(who) => who.clone(),
            None => format!("role:{}", self.assigned_role),
        }
    }
}

/// Inbox query over tasks. Unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    pub assignee: Option<String>,
    pub status: Option<TaskStatus>,
    pub instance_id: Option<Uuid>,
}

impl TaskFilter {
    pub fn matches(&self, task: &WorkflowTask) -> bool {
        self.assignee
            .as_ref()
            .map_or(true, |a| task.assigned_to.as_deref() == Some(a.as_str()))
            && self.status.map_or(true, |s| task.status == s)
            && self.instance_id.map_or(true, |id| task.instance_id == id)
    }
}

// ---------------------------------------------------------------------------
// task_actions
// ---------------------------------------------------------------------------

text_enum! {
    pub enum ActionType {
        Approve => "approve",
        Reject => "reject",
        Delegate => "delegate",
        RequestInfo => "request_info",
        Return => "return",
        Forward => "forward",
        Edit => "edit",
        Acknowledge => "acknowledge",
    }
}

text_enum! {
    /// State-machine consequence of an action.
    pub enum Effect {
        AdvanceStage => "advance_stage",
        RewindStage => "rewind_stage",
        Reassign => "reassign",
        Hold => "hold",
        Complete => "complete",
    }
}

impl ActionType {
    /// Effect used when a stage does not override it.
    pub fn default_effect(&self) -> Effect {
        match self {
            Self::Approve | Self::Acknowledge => Effect::AdvanceStage,
            Self::Reject | Self::Return => Effect::RewindStage,
            Self::Delegate | Self::Forward => Effect::Reassign,
            Self::RequestInfo | Self::Edit => Effect::Hold,
        }
    }
}

/// Append-only audit record of an action taken on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAction {
    pub id: Uuid,
    pub task_id: Uuid,
    pub instance_id: Uuid,
    /// The stage-level action name (e.g. `ConfirmCoverage`).
    pub action_name: String,
    pub action_type: ActionType,
    pub effect: Effect,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
    pub comments: Option<String>,
    pub delegate_to: Option<String>,
    pub from_stage: String,
    pub to_stage: Option<String>,
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

text_enum! {
    pub enum NotificationKind {
        Assigned => "assigned",
        Due => "due",
        Overdue => "overdue",
        Completed => "completed",
        Escalated => "escalated",
    }
}

text_enum! {
    pub enum NotificationStatus {
        Pending => "pending",
        Sent => "sent",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

/// A persisted notification (outbox row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub instance_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub recipient: String,
    pub channels: Vec<String>,
    pub subject: String,
    pub body: String,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub delivered_via: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip_through_text_and_names() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), *status);
        }
        assert_eq!(ActionType::from_name("RequestInfo"), Some(ActionType::RequestInfo));
        assert_eq!(ActionType::from_name("ConfirmCoverage"), None);
        assert!("bogus".parse::<Effect>().is_err());
    }

    #[test]
    fn default_effects_follow_the_action_table() {
        assert_eq!(ActionType::Approve.default_effect(), Effect::AdvanceStage);
        assert_eq!(ActionType::Acknowledge.default_effect(), Effect::AdvanceStage);
        assert_eq!(ActionType::Reject.default_effect(), Effect::RewindStage);
        assert_eq!(ActionType::Delegate.default_effect(), Effect::Reassign);
        assert_eq!(ActionType::RequestInfo.default_effect(), Effect::Hold);
    }

    #[test]
    fn terminal_and_open_states() {
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
        assert!(TaskStatus::InProgress.is_open());
        assert!(!TaskStatus::Delegated.is_open());
    }
}
