//! Process instance state machine.
//!
//! `ProcessEngine` is the central orchestrator:
//! 1. `initiate` binds an instance to the active definition of a process
//!    and opens the first stage's task.
//! 2. `execute_action` closes the current task and records the action in
//!    one store write, then moves the instance by the action's effect.
//! 3. A stage move checks the rules of the stage being entered first. A
//!    blocking violation records the action, keeps the task open and
//!    suspends the instance at its current stage; resubmitting the move
//!    once the violation is cleared enters the blocked stage.
//! 4. Notifications go through the dispatcher outbox; enqueue failures are
//!    logged and never fail a transition.
//!
//! Every transition of one instance runs under that instance's lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use db::models::{
    BusinessObjectRef, Effect, InstanceStatus, Notification, NotificationKind, ProcessInstance,
    TaskAction, TaskFilter, Violation, WorkflowTask,
};
use db::WorkflowStore;
use integrations::SnapshotProvider;
use queue::{Dispatcher, NotificationRequest, RenderContext};

use crate::locks::InstanceLocks;
use crate::models::{ProcessDefinition, Stage};
use crate::registry::DefinitionRegistry;
use crate::rules::{RuleReport, RuleValidator};
use crate::tasks::{TaskManager, TaskUpdate, DEFAULT_COOLDOWN_MINUTES};
use crate::EngineError;

/// Rule name reported when the business object could not be fetched.
pub const SNAPSHOT_RULE: &str = "business-object-snapshot";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Escalation cool-down for stages that do not set their own.
    pub escalation_cooldown_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            escalation_cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub business_object: BusinessObjectRef,
    pub initiator: String,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Stage-level action name (`Approve`, `ConfirmCoverage`…).
    #[serde(rename = "type")]
    pub action: String,
    pub performer: String,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub delegate_to: Option<String>,
    /// Merged into the process variables before rules run.
    #[serde(default)]
    pub variables: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_id: Uuid,
    pub effect: Effect,
    /// Stage the instance sits at afterwards; `None` once it has finished.
    pub next_stage: Option<String>,
    pub instance_status: InstanceStatus,
    /// The task now open for the instance, if any.
    pub next_task_id: Option<Uuid>,
    /// Blocking violations when the move suspended the instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

pub struct ProcessEngine {
    pub(crate) store: Arc<dyn WorkflowStore>,
    pub(crate) registry: DefinitionRegistry,
    pub(crate) rules: Arc<RuleValidator>,
    pub(crate) tasks: TaskManager,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) snapshots: Arc<dyn SnapshotProvider>,
    pub(crate) locks: InstanceLocks,
}

fn merge_variables(target: &mut Value, patch: Value) -> Result<(), EngineError> {
    let Value::Object(patch) = patch else {
        return Err(EngineError::Validation("variables must be a JSON object".into()));
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        target.extend(patch);
    }
    Ok(())
}

fn require(value: &str, what: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        Err(EngineError::Validation(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

impl ProcessEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        dispatcher: Arc<Dispatcher>,
        snapshots: Arc<dyn SnapshotProvider>,
        rules: Arc<RuleValidator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: DefinitionRegistry::new(Arc::clone(&store), Arc::clone(&rules)),
            tasks: TaskManager::new(Arc::clone(&store))
                .with_default_cooldown(config.escalation_cooldown_minutes),
            store,
            rules,
            dispatcher,
            snapshots,
            locks: InstanceLocks::new(),
        }
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn rules(&self) -> &RuleValidator {
        &self.rules
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Initiate
    // -----------------------------------------------------------------------

    /// Start an instance of the active version of `process_name`.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] when no version of the process is active.
    #[instrument(skip(self, request), fields(initiator = %request.initiator))]
    pub async fn initiate(
        &self,
        process_name: &str,
        request: InitiateRequest,
    ) -> Result<ProcessInstance, EngineError> {
        require(&request.initiator, "initiator")?;
        require(&request.business_object.object_type, "business object type")?;
        require(&request.business_object.object_id, "business object id")?;

        let mut variables = Value::Object(Map::new());
        match request.variables {
            Value::Null => {}
            patch => merge_variables(&mut variables, patch)?,
        }

        let definition = self.registry.get(process_name, None).await?;
        let first = definition
            .stage(0)
            .ok_or_else(|| EngineError::InvalidState(format!("'{process_name}' has no stages")))?;

        let now = Utc::now();
        let mut instance = ProcessInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            process_name: definition.name.clone(),
            category: definition.category.clone(),
            business_object: request.business_object,
            current_stage: first.name.clone(),
            stage_index: 0,
            status: InstanceStatus::Active,
            status_reason: None,
            violations: Vec::new(),
            variables,
            initiator: request.initiator,
            started_at: now,
            completed_at: None,
            version: 0,
        };

        let _guard = self.locks.lock(instance.id).await;
        let admitted = self.prepare_stage(&definition, &mut instance, 0).await;
        self.store.insert_instance(&instance).await?;
        info!(instance_id = %instance.id, process = %definition.name, version = definition.version, "instance started");

        if admitted {
            self.open_stage_task(&definition, &instance, now).await?;
        } else {
            self.notify_rule_owner(&definition, &instance).await;
        }
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // ExecuteAction
    // -----------------------------------------------------------------------

    /// Take `request.action` on a task and move the instance accordingly.
    ///
    /// # Errors
    /// - [`EngineError::InvalidState`] when the task is closed or its
    ///   instance is not active; nothing is changed. An instance suspended
    ///   by rules only accepts a resubmitted stage move.
    /// - [`EngineError::Validation`] for an action the task does not permit.
    /// - [`EngineError::Conflict`] when another caller moved the task first.
    #[instrument(skip(self, request), fields(action = %request.action, performer = %request.performer))]
    pub async fn execute_action(
        &self,
        task_id: Uuid,
        request: ActionRequest,
    ) -> Result<ActionResult, EngineError> {
        require(&request.performer, "performer")?;
        let seen = self.tasks.get(task_id).await?;

        let _guard = self.locks.lock(seen.instance_id).await;
        let task = self.tasks.get(task_id).await?;
        if task.version != seen.version {
            return Err(EngineError::Conflict(format!(
                "task {task_id} was modified concurrently"
            )));
        }
        if !task.status.is_open() {
            return Err(EngineError::InvalidState(format!(
                "task {} is {}",
                task.id, task.status
            )));
        }

        let mut instance = self.store.get_instance(task.instance_id).await?;
        let held_by_rules = instance.status == InstanceStatus::Suspended && !instance.violations.is_empty();
        if instance.status != InstanceStatus::Active && !held_by_rules {
            return Err(EngineError::InvalidState(format!(
                "instance {} is {}",
                instance.id, instance.status
            )));
        }
        let (definition, stage) = self.bound_stage(&instance).await?;

        // ------------------------------------------------------------------
        // Resolve the action.
        // ------------------------------------------------------------------
        if !task.permitted_actions.iter().any(|a| a == &request.action) {
            return Err(EngineError::Validation(format!(
                "action '{}' is not permitted on task '{}' (permitted: {})",
                request.action,
                task.name,
                task.permitted_actions.join(", ")
            )));
        }
        let action_type = stage.action_type(&request.action).ok_or_else(|| {
            EngineError::Validation(format!("action '{}' has no action type", request.action))
        })?;
        let effect = stage.effect_for(&request.action, action_type);
        if held_by_rules && !matches!(effect, Effect::AdvanceStage | Effect::RewindStage) {
            return Err(EngineError::InvalidState(format!(
                "instance {} is suspended by business rules; only a stage move can be resubmitted",
                instance.id
            )));
        }
        let mut variables_changed = false;
        if let Some(patch) = request.variables.clone() {
            merge_variables(&mut instance.variables, patch)?;
            variables_changed = true;
        }

        // ------------------------------------------------------------------
        // Check the stage being entered before anything is written.
        // ------------------------------------------------------------------
        let index = instance.stage_index as usize;
        let target = match effect {
            Effect::AdvanceStage => Some(index + 1).filter(|next| *next < definition.stages.len()),
            Effect::RewindStage => index.checked_sub(1),
            Effect::Reassign | Effect::Hold | Effect::Complete => None,
        };
        let mut blocked = None;
        if let Some(next) = target.and_then(|i| definition.stage(i)) {
            let report = self.check_rules(&definition, &instance, next).await;
            if !report.ok {
                blocked = Some((next.name.clone(), report.blocking()));
            }
        }

        // ------------------------------------------------------------------
        // Close (or hold) the task and record the action in one write.
        // ------------------------------------------------------------------
        let now = Utc::now();
        let to_stage = match (effect, &blocked) {
            (_, Some(_)) | (Effect::Reassign | Effect::Hold, None) => Some(stage.name.clone()),
            (Effect::AdvanceStage | Effect::RewindStage, None) => {
                target.and_then(|i| definition.stage(i)).map(|s| s.name.clone())
            }
            (Effect::Complete, None) => None,
        };
        let action = TaskAction {
            id: Uuid::new_v4(),
            task_id: task.id,
            instance_id: instance.id,
            action_name: request.action.clone(),
            action_type,
            effect,
            performed_by: request.performer.clone(),
            performed_at: now,
            comments: request.comments.clone(),
            delegate_to: request.delegate_to.clone(),
            from_stage: stage.name.clone(),
            to_stage,
        };
        let update = TaskUpdate {
            // A blocked move leaves the task open for resubmission.
            effect: if blocked.is_some() { Effect::Hold } else { effect },
            performer: request.performer.clone(),
            comments: request.comments.clone(),
            delegate_to: request.delegate_to.clone(),
        };
        let task = self.tasks.record(task, &update, &action, now).await?;
        info!(task_id = %task.id, instance_id = %instance.id, %effect, "action recorded");

        // ------------------------------------------------------------------
        // Apply the effect to the instance. The action is stored by now, so
        // an instance that cannot follow it is failed rather than left behind.
        // ------------------------------------------------------------------
        let followed = match blocked {
            Some((blocked_at, violations)) => {
                self.hold_for_rules(&definition, &mut instance, blocked_at, violations)
                    .await
                    .map(|()| Some(task))
            }
            None => {
                self.follow_effect(&definition, &mut instance, task, effect, target, &request, variables_changed, now)
                    .await
            }
        };
        let next_task = match followed {
            Ok(next_task) => next_task,
            Err(err) => {
                if let Ok(current) = self.store.get_instance(instance.id).await {
                    if !current.status.is_terminal() {
                        self.fail_instance(current, &format!("action {} could not be applied: {err}", action.id))
                            .await;
                    }
                }
                return Err(err);
            }
        };

        Ok(ActionResult {
            action_id: action.id,
            effect,
            next_stage: (!instance.status.is_terminal()).then(|| instance.current_stage.clone()),
            instance_status: instance.status,
            next_task_id: next_task.map(|t| t.id),
            violations: instance.violations.clone(),
        })
    }

    /// Suspend an instance whose move was refused by the rules of the stage
    /// it was about to enter. It stays at its current stage with the task
    /// open, and the rule owner is told.
    async fn hold_for_rules(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        blocked_at: String,
        violations: Vec<Violation>,
    ) -> Result<(), EngineError> {
        instance.status = InstanceStatus::Suspended;
        instance.status_reason = Some(format!("blocked by business rules at stage '{blocked_at}'"));
        instance.violations = violations;
        *instance = self.store.update_instance(instance).await?;
        warn!(
            instance_id = %instance.id,
            stage = %blocked_at,
            violations = instance.violations.len(),
            "stage blocked by business rules"
        );
        self.notify_rule_owner(definition, instance).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn follow_effect(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        task: WorkflowTask,
        effect: Effect,
        target: Option<usize>,
        request: &ActionRequest,
        variables_changed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowTask>, EngineError> {
        match (effect, target) {
            (Effect::Hold, _) => {
                if variables_changed {
                    *instance = self.store.update_instance(instance).await?;
                }
                Ok(Some(task))
            }
            (Effect::Reassign, _) => {
                if variables_changed {
                    *instance = self.store.update_instance(instance).await?;
                }
                let target = request.delegate_to.as_deref().unwrap_or_default();
                let replacement = self.tasks.reassign(&task, target, now).await?;
                self.notify_task(definition, instance, &replacement, NotificationKind::Assigned, None)
                    .await;
                Ok(Some(replacement))
            }
            (Effect::AdvanceStage | Effect::RewindStage, Some(index)) => {
                self.move_to_stage(definition, instance, index, now).await.map(Some)
            }
            (Effect::AdvanceStage | Effect::Complete, _) => {
                self.finish(definition, instance, InstanceStatus::Completed, None, now)
                    .await?;
                Ok(None)
            }
            (Effect::RewindStage, None) => {
                let reason = format!("rejected at first stage by {}", request.performer);
                self.finish(definition, instance, InstanceStatus::Cancelled, Some(reason), now)
                    .await?;
                Ok(None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Administrative transitions
    // -----------------------------------------------------------------------

    /// Cancel a non-terminal instance together with its open task and the
    /// task's undelivered notifications.
    #[instrument(skip(self, reason))]
    pub async fn cancel(&self, instance_id: Uuid, actor: &str, reason: &str) -> Result<ProcessInstance, EngineError> {
        require(actor, "actor")?;
        let _guard = self.locks.lock(instance_id).await;
        let mut instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "instance {} is already {}",
                instance.id, instance.status
            )));
        }

        let now = Utc::now();
        if let Some(open) = self.store.open_task_for_instance(instance.id).await? {
            self.tasks.cancel(open.id, now).await?;
            if let Err(err) = self.dispatcher.cancel_for_task(open.id).await {
                warn!(task_id = %open.id, error = %err, "could not cancel pending notifications");
            }
        }

        let reason = if reason.trim().is_empty() {
            format!("cancelled by {actor}")
        } else {
            format!("cancelled by {actor}: {reason}")
        };
        match self.registry.get_by_id(instance.definition_id).await {
            Ok(definition) => {
                self.finish(&definition, &mut instance, InstanceStatus::Cancelled, Some(reason), now)
                    .await?;
            }
            Err(err) => {
                warn!(instance_id = %instance.id, error = %err, "cancelling instance without its definition");
                instance.status = InstanceStatus::Cancelled;
                instance.status_reason = Some(reason);
                instance.completed_at = Some(now);
                instance = self.store.update_instance(&instance).await?;
            }
        }
        Ok(instance)
    }

    /// Administrative `Active -> Suspended`. The open task stays in place.
    #[instrument(skip(self, reason))]
    pub async fn suspend(&self, instance_id: Uuid, actor: &str, reason: &str) -> Result<ProcessInstance, EngineError> {
        require(actor, "actor")?;
        let _guard = self.locks.lock(instance_id).await;
        let mut instance = self.store.get_instance(instance_id).await?;
        if instance.status != InstanceStatus::Active {
            return Err(EngineError::InvalidState(format!(
                "instance {} is {}",
                instance.id, instance.status
            )));
        }
        instance.status = InstanceStatus::Suspended;
        instance.status_reason = Some(format!("suspended by {actor}: {reason}"));
        let instance = self.store.update_instance(&instance).await?;
        info!(instance_id = %instance.id, "instance suspended");
        Ok(instance)
    }

    /// `Suspended -> Active`.
    ///
    /// With a task still open (administrative suspension, or a stage move
    /// refused by rules) the instance simply becomes active again and the
    /// move can be resubmitted. An instance blocked on entering its first
    /// stage has no task yet: it is re-validated, and the stage's task is
    /// opened once the violations are gone. Remaining violations come back
    /// as [`EngineError::RuleViolation`].
    #[instrument(skip(self))]
    pub async fn resume(&self, instance_id: Uuid, actor: &str) -> Result<ProcessInstance, EngineError> {
        require(actor, "actor")?;
        let _guard = self.locks.lock(instance_id).await;
        let mut instance = self.store.get_instance(instance_id).await?;
        if instance.status != InstanceStatus::Suspended {
            return Err(EngineError::InvalidState(format!(
                "instance {} is {}, not suspended",
                instance.id, instance.status
            )));
        }
        let (definition, stage) = self.bound_stage(&instance).await?;
        let now = Utc::now();

        if self.store.open_task_for_instance(instance.id).await?.is_some() {
            instance.status = InstanceStatus::Active;
            instance.status_reason = None;
            instance.violations.clear();
            let instance = self.store.update_instance(&instance).await?;
            info!(instance_id = %instance.id, %actor, "instance resumed");
            return Ok(instance);
        }

        let report = self.check_rules(&definition, &instance, &stage).await;
        if !report.ok {
            instance.violations = report.blocking();
            let instance = self.store.update_instance(&instance).await?;
            warn!(instance_id = %instance.id, violations = instance.violations.len(), "resume blocked by business rules");
            return Err(EngineError::RuleViolation(instance.violations));
        }

        instance.status = InstanceStatus::Active;
        instance.status_reason = None;
        instance.violations.clear();
        let instance = self.store.update_instance(&instance).await?;
        info!(instance_id = %instance.id, %actor, stage = %stage.name, "instance resumed");
        self.open_stage_task(&definition, &instance, now).await?;
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<ProcessInstance, EngineError> {
        Ok(self.store.get_instance(instance_id).await?)
    }

    pub async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<ProcessInstance>, EngineError> {
        Ok(self.store.list_instances(status).await?)
    }

    /// Audit trail of an instance, oldest first.
    pub async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<TaskAction>, EngineError> {
        self.store.get_instance(instance_id).await?;
        Ok(self.store.list_actions(instance_id).await?)
    }

    pub async fn list_notifications(&self, instance_id: Uuid) -> Result<Vec<Notification>, EngineError> {
        self.store.get_instance(instance_id).await?;
        Ok(self.store.list_notifications(instance_id).await?)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<WorkflowTask, EngineError> {
        self.tasks.get(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, EngineError> {
        self.tasks.list(filter).await
    }

    pub async fn claim_task(&self, task_id: Uuid, actor: &str) -> Result<WorkflowTask, EngineError> {
        require(actor, "actor")?;
        let task = self.tasks.get(task_id).await?;
        let _guard = self.locks.lock(task.instance_id).await;
        self.tasks.claim(task_id, actor, Utc::now()).await
    }

    pub async fn comment_task(
        &self,
        task_id: Uuid,
        author: &str,
        text: &str,
        attachments: Vec<String>,
    ) -> Result<WorkflowTask, EngineError> {
        require(author, "author")?;
        let task = self.tasks.get(task_id).await?;
        let _guard = self.locks.lock(task.instance_id).await;
        self.tasks.comment(task_id, author, text, attachments, Utc::now()).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Load the bound definition and the instance's current stage. An
    /// instance whose definition or stage is gone is marked `Failed`.
    async fn bound_stage(&self, instance: &ProcessInstance) -> Result<(ProcessDefinition, Stage), EngineError> {
        let definition = match self.registry.get_by_id(instance.definition_id).await {
            Ok(definition) => definition,
            Err(err @ EngineError::Storage(db::DbError::Sqlx(_))) => return Err(err),
            Err(err) => {
                let reason = format!("bound definition unavailable: {err}");
                self.fail_instance(instance.clone(), &reason).await;
                return Err(EngineError::InvalidState(reason));
            }
        };
        match definition.stage(instance.stage_index as usize) {
            Some(stage) if stage.name == instance.current_stage => {
                let stage = stage.clone();
                Ok((definition, stage))
            }
            _ => {
                let reason = format!(
                    "stage '{}' (index {}) is not part of '{}' version {}",
                    instance.current_stage, instance.stage_index, definition.name, definition.version
                );
                self.fail_instance(instance.clone(), &reason).await;
                Err(EngineError::InvalidState(reason))
            }
        }
    }

    /// Point the instance at `index` and run the stage's rules. Returns
    /// whether the stage may open; a blocked instance is left `Suspended`
    /// with its violations.
    async fn prepare_stage(&self, definition: &ProcessDefinition, instance: &mut ProcessInstance, index: usize) -> bool {
        let Some(stage) = definition.stage(index) else {
            return false;
        };
        instance.current_stage = stage.name.clone();
        instance.stage_index = index as i32;

        let report = self.check_rules(definition, instance, stage).await;
        if report.ok {
            instance.violations.clear();
            return true;
        }
        instance.status = InstanceStatus::Suspended;
        instance.status_reason = Some(format!("blocked by business rules at stage '{}'", stage.name));
        instance.violations = report.blocking();
        warn!(instance_id = %instance.id, stage = %stage.name, violations = instance.violations.len(), "stage blocked by business rules");
        false
    }

    /// Point the instance at `index`, whose rules already passed, and open
    /// the stage's task.
    async fn move_to_stage(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        let stage = definition
            .stage(index)
            .ok_or_else(|| EngineError::InvalidState(format!("stage index {index} out of range")))?;
        instance.current_stage = stage.name.clone();
        instance.stage_index = index as i32;
        instance.status = InstanceStatus::Active;
        instance.status_reason = None;
        instance.violations.clear();
        *instance = self.store.update_instance(instance).await?;
        info!(instance_id = %instance.id, stage = %instance.current_stage, "instance moved");
        self.open_stage_task(definition, instance, now).await
    }

    /// Open the current stage's task and announce it. A task that cannot
    /// be opened fails the instance.
    async fn open_stage_task(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTask, EngineError> {
        let index = instance.stage_index as usize;
        let opened = match definition.stage(index) {
            Some(stage) => self.tasks.open(instance, index, stage, now).await,
            None => Err(EngineError::InvalidState(format!(
                "stage index {index} out of range"
            ))),
        };
        match opened {
            Ok(task) => {
                if definition.notification_policy.notify_on_assignment {
                    self.notify_task(definition, instance, &task, NotificationKind::Assigned, None)
                        .await;
                }
                Ok(task)
            }
            Err(err) => {
                self.fail_instance(instance.clone(), &format!("could not open task: {err}"))
                    .await;
                Err(err)
            }
        }
    }

    /// Move the instance to a terminal status and tell the initiator.
    async fn finish(
        &self,
        definition: &ProcessDefinition,
        instance: &mut ProcessInstance,
        status: InstanceStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        instance.status = status;
        instance.status_reason = reason;
        instance.completed_at = Some(now);
        *instance = self.store.update_instance(instance).await?;
        info!(instance_id = %instance.id, %status, "instance finished");

        if definition.notification_policy.notify_on_completion {
            let detail = match &instance.status_reason {
                Some(reason) => format!("Outcome: {status} ({reason})."),
                None => format!("Outcome: {status}."),
            };
            self.notify(
                definition,
                instance,
                None,
                NotificationKind::Completed,
                instance.initiator.clone(),
                Some(detail),
            )
            .await;
        }
        Ok(())
    }

    /// Best effort: the instance is returned as stored, or as passed when
    /// even that write fails.
    async fn fail_instance(&self, mut instance: ProcessInstance, reason: &str) -> ProcessInstance {
        error!(instance_id = %instance.id, reason, "instance failed");
        instance.status = InstanceStatus::Failed;
        instance.status_reason = Some(reason.to_string());
        instance.completed_at = Some(Utc::now());
        match self.store.update_instance(&instance).await {
            Ok(stored) => stored,
            Err(err) => {
                error!(instance_id = %instance.id, error = %err, "could not mark instance failed");
                instance
            }
        }
    }

    /// Evaluate the rules that apply at `stage`. Rules that need the
    /// business object fail closed when it cannot be fetched.
    pub(crate) async fn check_rules(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        stage: &Stage,
    ) -> RuleReport {
        if !self.rules.has_rules_for(definition, &stage.name) {
            return RuleReport::passed();
        }
        let object = &instance.business_object;
        let report = match self
            .snapshots
            .get_snapshot(&object.object_type, &object.object_id)
            .await
        {
            Ok(snapshot) => self.rules.validate_for(definition, &stage.name, &snapshot),
            Err(err) => {
                warn!(instance_id = %instance.id, error = %err, "business object snapshot unavailable");
                RuleReport {
                    ok: false,
                    violations: vec![Violation {
                        rule: SNAPSHOT_RULE.to_string(),
                        rule_version: 0,
                        priority: i32::MIN,
                        blocking: true,
                        message: format!("business object could not be loaded: {err}"),
                    }],
                }
            }
        };
        for warning in report.warnings() {
            info!(instance_id = %instance.id, rule = %warning.rule, message = %warning.message, "rule warning");
        }
        report
    }

    // ----- notifications -----

    async fn notify_rule_owner(&self, definition: &ProcessDefinition, instance: &ProcessInstance) {
        let owner = definition
            .notification_policy
            .rule_owner
            .clone()
            .unwrap_or_else(|| instance.initiator.clone());
        let detail = instance
            .violations
            .iter()
            .map(|v| format!("- {}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("\n");
        self.notify(
            definition,
            instance,
            None,
            NotificationKind::Escalated,
            owner,
            Some(format!("Blocking rule violations:\n{detail}")),
        )
        .await;
    }

    pub(crate) async fn notify_task(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        task: &WorkflowTask,
        kind: NotificationKind,
        detail: Option<String>,
    ) {
        self.notify(definition, instance, Some(task), kind, task.recipient(), detail)
            .await;
    }

    async fn notify(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        task: Option<&WorkflowTask>,
        kind: NotificationKind,
        recipient: String,
        detail: Option<String>,
    ) {
        let policy = &definition.notification_policy;
        let request = NotificationRequest {
            instance_id: Some(instance.id),
            task_id: task.map(|t| t.id),
            kind,
            recipient: recipient.clone(),
            channels: policy.channels.clone(),
            context: RenderContext {
                process: definition.name.clone(),
                task: task.map(|t| t.name.clone()).unwrap_or_default(),
                stage: task
                    .map(|t| t.stage_name.clone())
                    .unwrap_or_else(|| instance.current_stage.clone()),
                object: instance.business_object.display_name.clone(),
                recipient,
                due: task.map(|t| t.due_at),
                detail,
            },
            body_template: policy.templates.get(&kind).cloned(),
        };
        if let Err(err) = self.dispatcher.enqueue(request).await {
            warn!(instance_id = %instance.id, %kind, error = %err, "notification not enqueued");
        }
    }
}
