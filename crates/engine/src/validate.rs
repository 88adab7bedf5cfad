//! Definition validation. Run this before a definition is stored.
//!
//! Rules enforced:
//! 1. The process name and category are non-empty.
//! 2. There is at least one stage.
//! 3. Stage orders are strictly increasing and exactly `1..=n`.
//! 4. Every stage has a role (listed in `roles` when that set is given)
//!    and at least one permitted action, without duplicates.
//! 5. Alias and effect tables only mention permitted actions, and every
//!    permitted action resolves to an action type.
//! 6. Escalation targets and SLAs are well-formed, and every duration
//!    stays within the bounds below.

use std::collections::HashSet;

use crate::models::{DefinitionSpec, Stage};
use crate::EngineError;

/// Longest SLA or reminder lead time a definition may set (ten years).
pub const MAX_SLA_HOURS: u32 = 87_600;
/// Longest escalation cool-down a definition may set (one year).
pub const MAX_COOLDOWN_MINUTES: u32 = 525_600;

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

/// Validate an authored definition.
///
/// # Errors
/// [`EngineError::Validation`] naming the first problem found.
pub fn validate_definition(spec: &DefinitionSpec) -> Result<(), EngineError> {
    if spec.name.trim().is_empty() {
        return Err(invalid("process name must not be empty"));
    }
    if spec.category.trim().is_empty() {
        return Err(invalid("process category must not be empty"));
    }
    if spec.stages.is_empty() {
        return Err(invalid("a process needs at least one stage"));
    }

    // -----------------------------------------------------------------------
    // Ordinals
    // -----------------------------------------------------------------------
    for pair in spec.stages.windows(2) {
        if pair[1].order <= pair[0].order {
            return Err(invalid(format!(
                "stage order is not strictly increasing: '{}' ({}) follows '{}' ({})",
                pair[1].name, pair[1].order, pair[0].name, pair[0].order
            )));
        }
    }
    for (index, stage) in spec.stages.iter().enumerate() {
        let expected = index as u32 + 1;
        if stage.order != expected {
            return Err(invalid(format!(
                "stage '{}' has order {} but {} was expected (orders must be contiguous from 1)",
                stage.name, stage.order, expected
            )));
        }
    }

    for stage in &spec.stages {
        validate_stage(spec, stage)?;
    }

    if let Some(hours) = spec.notification_policy.reminder_hours {
        if hours > MAX_SLA_HOURS {
            return Err(invalid(format!(
                "reminder lead time of {hours}h exceeds the {MAX_SLA_HOURS}h limit"
            )));
        }
    }
    Ok(())
}

fn validate_stage(spec: &DefinitionSpec, stage: &Stage) -> Result<(), EngineError> {
    if stage.name.trim().is_empty() {
        return Err(invalid(format!("stage {} has no name", stage.order)));
    }
    if stage.task.name.trim().is_empty() {
        return Err(invalid(format!("stage '{}' has no task name", stage.name)));
    }
    if stage.role.trim().is_empty() {
        return Err(invalid(format!("stage '{}' has no role", stage.name)));
    }
    if !spec.roles.is_empty() && !spec.roles.contains(&stage.role) {
        return Err(invalid(format!(
            "stage '{}' uses role '{}' which is not a participant role",
            stage.name, stage.role
        )));
    }

    if stage.permitted_actions.is_empty() {
        return Err(invalid(format!("stage '{}' permits no actions", stage.name)));
    }
    let mut seen = HashSet::new();
    for action in &stage.permitted_actions {
        if !seen.insert(action.as_str()) {
            return Err(invalid(format!(
                "stage '{}' lists action '{}' twice",
                stage.name, action
            )));
        }
        if stage.action_type(action).is_none() {
            return Err(invalid(format!(
                "stage '{}': action '{}' is neither a built-in action nor aliased in actionTypes",
                stage.name, action
            )));
        }
    }

    let referenced = stage.action_types.keys().chain(stage.effects.keys());
    for action in referenced {
        if !seen.contains(action.as_str()) {
            return Err(invalid(format!(
                "stage '{}' configures action '{}' which is not permitted",
                stage.name, action
            )));
        }
    }

    match stage.sla_hours {
        Some(0) => return Err(invalid(format!("stage '{}' has a zero SLA", stage.name))),
        Some(hours) if hours > MAX_SLA_HOURS => {
            return Err(invalid(format!(
                "stage '{}' has an SLA of {hours}h, above the {MAX_SLA_HOURS}h limit",
                stage.name
            )))
        }
        _ => {}
    }
    if let Some(minutes) = stage.escalation.cooldown_minutes {
        if minutes > MAX_COOLDOWN_MINUTES {
            return Err(invalid(format!(
                "stage '{}' has an escalation cool-down of {minutes} minutes, above the {MAX_COOLDOWN_MINUTES} limit",
                stage.name
            )));
        }
    }
    if stage.escalation.enabled {
        if let Some(target) = &stage.escalation.escalate_to {
            if target.trim().is_empty() {
                return Err(invalid(format!(
                    "stage '{}' escalates to an empty identity",
                    stage.name
                )));
            }
        }
    }
    Ok(())
}
