//! Core domain models for the process engine.
//!
//! A [`DefinitionSpec`] is what authors write (JSON files, API bodies); a
//! [`ProcessDefinition`] is a registered, versioned copy of it. The typed
//! stage list is stored in the JSON `body` column of `process_definitions`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use db::models::{ActionType, DefinitionRecord, DefinitionStatus, Effect, NotificationKind};

use crate::EngineError;

/// SLA used when a stage does not declare one.
pub const DEFAULT_SLA_HOURS: u32 = 24;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// What the task opened for a stage looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_task_kind")]
    pub kind: String,
}

fn default_task_kind() -> String {
    "approval".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Overdue tasks are reassigned here; `None` escalates in place.
    #[serde(default)]
    pub escalate_to: Option<String>,
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
}

/// One step of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// 1-based ordinal; a definition's stages are numbered `1..=n`.
    pub order: u32,
    pub name: String,
    pub task: TaskTemplate,
    /// Role responsible for the stage's task.
    pub role: String,
    pub permitted_actions: Vec<String>,
    /// Stage-level action names mapped to the action they stand for
    /// (`ConfirmCoverage -> Approve`).
    #[serde(default)]
    pub action_types: BTreeMap<String, ActionType>,
    /// Per-action effect overrides.
    #[serde(default)]
    pub effects: BTreeMap<String, Effect>,
    /// Fixed assignee; otherwise `variables.assignees.<role>` or the role inbox.
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub sla_hours: Option<u32>,
    #[serde(default)]
    pub escalation: EscalationPolicy,
}

impl Stage {
    /// Resolve a stage-level action name to its type: alias table first,
    /// then the built-in variant name.
    pub fn action_type(&self, action: &str) -> Option<ActionType> {
        self.action_types
            .get(action)
            .copied()
            .or_else(|| ActionType::from_name(action))
    }

    pub fn effect_for(&self, action: &str, action_type: ActionType) -> Effect {
        self.effects
            .get(action)
            .copied()
            .unwrap_or_else(|| action_type.default_effect())
    }

    pub fn sla(&self) -> Duration {
        Duration::hours(i64::from(self.sla_hours.unwrap_or(DEFAULT_SLA_HOURS)))
    }
}

// ---------------------------------------------------------------------------
// Notification policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPolicy {
    /// Channels tried in order; empty means the dispatcher defaults.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "enabled")]
    pub notify_on_assignment: bool,
    #[serde(default = "enabled")]
    pub notify_on_completion: bool,
    /// Receives rule-violation escalations; the initiator when unset.
    #[serde(default)]
    pub rule_owner: Option<String>,
    /// Send one `Due` reminder this many hours before a task is due.
    #[serde(default)]
    pub reminder_hours: Option<u32>,
    /// Body template overrides per notification kind.
    #[serde(default)]
    pub templates: BTreeMap<NotificationKind, String>,
}

fn enabled() -> bool {
    true
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            notify_on_assignment: true,
            notify_on_completion: true,
            rule_owner: None,
            reminder_hours: None,
            templates: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// An authored process template, before registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSpec {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<Stage>,
    /// Participant roles; when non-empty every stage role must be listed.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Rules evaluated in addition to the category-scoped ones.
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub notification_policy: NotificationPolicy,
}

/// A registered definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub category: String,
    pub description: String,
    pub status: DefinitionStatus,
    pub stages: Vec<Stage>,
    pub roles: BTreeSet<String>,
    pub business_rules: Vec<String>,
    pub notification_policy: NotificationPolicy,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl ProcessDefinition {
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Build the row stored for a freshly registered version.
    pub(crate) fn new_record(
        spec: &DefinitionSpec,
        version: i32,
        now: DateTime<Utc>,
    ) -> Result<DefinitionRecord, EngineError> {
        let body = serde_json::to_value(spec)
            .map_err(|e| EngineError::Validation(format!("definition is not serialisable: {e}")))?;
        Ok(DefinitionRecord {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            version,
            category: spec.category.clone(),
            status: DefinitionStatus::Draft,
            body,
            created_at: now,
            activated_at: None,
        })
    }
}

impl TryFrom<DefinitionRecord> for ProcessDefinition {
    type Error = EngineError;

    fn try_from(record: DefinitionRecord) -> Result<Self, Self::Error> {
        let spec: DefinitionSpec = serde_json::from_value(record.body).map_err(|e| {
            EngineError::Storage(db::DbError::Corrupt(format!(
                "definition {} body: {e}",
                record.id
            )))
        })?;
        Ok(Self {
            id: record.id,
            name: record.name,
            version: record.version,
            category: record.category,
            description: spec.description,
            status: record.status,
            stages: spec.stages,
            roles: spec.roles,
            business_rules: spec.business_rules,
            notification_policy: spec.notification_policy,
            created_at: record.created_at,
            activated_at: record.activated_at,
        })
    }
}
