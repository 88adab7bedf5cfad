//! Scenario tests for the process engine.
//!
//! Everything runs against `MemoryStore`, a `MockChannel` behind the
//! dispatcher and `StaticSnapshots` for business objects, so no Postgres
//! connection is required. Scheduler and dispatcher work is driven with
//! explicit timestamps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use db::models::{
    ActionType, BusinessObjectRef, DefinitionRecord, DefinitionStatus, Effect, InstanceStatus, Notification,
    NotificationKind, NotificationStatus, ProcessInstance, TaskAction, TaskFilter, TaskStatus, WorkflowTask,
};
use db::{DbError, MemoryStore, WorkflowStore};
use integrations::mock::{MockChannel, StaticSnapshots};
use integrations::NotificationChannel;
use queue::{ChannelRegistry, Dispatcher, DispatcherConfig};

use crate::escalation::{EscalationConfig, EscalationScheduler};
use crate::machine::{ActionRequest, ActionResult, EngineConfig, InitiateRequest, ProcessEngine, SNAPSHOT_RULE};
use crate::models::{DefinitionSpec, EscalationPolicy, NotificationPolicy, Stage, TaskTemplate};
use crate::rules::{BusinessRule, FieldPresent, RuleValidator};
use crate::tasks::TaskUpdate;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    engine: Arc<ProcessEngine>,
    channel: MockChannel,
    snapshots: StaticSnapshots,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let channel = MockChannel::delivering();
    let mut channels: ChannelRegistry = HashMap::new();
    channels.insert("email".into(), Arc::new(channel.clone()) as Arc<dyn NotificationChannel>);
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        channels,
        DispatcherConfig::default(),
    ));
    let snapshots = StaticSnapshots::new();
    let engine = Arc::new(ProcessEngine::new(
        store.clone(),
        dispatcher,
        Arc::new(snapshots.clone()),
        Arc::new(RuleValidator::new()),
        EngineConfig::default(),
    ));
    Harness {
        store,
        engine,
        channel,
        snapshots,
    }
}

fn stage(order: u32, name: &str, actions: &[&str]) -> Stage {
    Stage {
        order,
        name: name.into(),
        task: TaskTemplate {
            name: format!("{name} review"),
            description: String::new(),
            kind: "approval".into(),
        },
        role: name.into(),
        permitted_actions: actions.iter().map(|a| a.to_string()).collect(),
        action_types: Default::default(),
        effects: Default::default(),
        assignee: None,
        sla_hours: None,
        escalation: EscalationPolicy::default(),
    }
}

/// Supervisor -> planner -> HR -> supervisor sign-off.
fn vacation_spec() -> DefinitionSpec {
    let mut planner = stage(2, "planner", &["Approve", "RequestInfo", "ConfirmCoverage", "Reject"]);
    planner
        .action_types
        .insert("ConfirmCoverage".into(), ActionType::Approve);
    let mut hr = stage(3, "hr", &["Approve", "FlagIssues"]);
    hr.action_types.insert("FlagIssues".into(), ActionType::Reject);

    DefinitionSpec {
        name: "Vacation Approval".into(),
        category: "hr".into(),
        description: "Leave requests".into(),
        stages: vec![
            stage(1, "supervisor", &["Approve", "Reject", "Delegate"]),
            planner,
            hr,
            stage(4, "sign-off", &["Approve", "Reject"]),
        ],
        roles: Default::default(),
        business_rules: vec![],
        notification_policy: NotificationPolicy {
            rule_owner: Some("hr-owner".into()),
            ..NotificationPolicy::default()
        },
    }
}

async fn activate(h: &Harness, spec: DefinitionSpec) {
    let def = h.engine.registry().register(spec).await.unwrap();
    h.engine.registry().activate(def.id).await.unwrap();
}

async fn start(h: &Harness, process: &str) -> ProcessInstance {
    h.engine
        .initiate(
            process,
            InitiateRequest {
                business_object: BusinessObjectRef {
                    object_type: "vacation".into(),
                    object_id: "7".into(),
                    display_name: "Vacation #7".into(),
                },
                initiator: "alex".into(),
                variables: json!({
                    "assignees": { "supervisor": "sam", "planner": "pat", "hr": "hana", "sign-off": "sam" }
                }),
            },
        )
        .await
        .unwrap()
}

async fn open_task(h: &Harness, instance_id: Uuid) -> WorkflowTask {
    h.store
        .open_task_for_instance(instance_id)
        .await
        .unwrap()
        .expect("an open task")
}

fn request(action: &str, performer: &str) -> ActionRequest {
    ActionRequest {
        action: action.into(),
        performer: performer.into(),
        comments: None,
        delegate_to: None,
        variables: None,
    }
}

async fn act(h: &Harness, task_id: Uuid, action: &str, performer: &str) -> ActionResult {
    h.engine
        .execute_action(task_id, request(action, performer))
        .await
        .unwrap()
}

async fn notifications_of(h: &Harness, instance_id: Uuid, kind: NotificationKind) -> usize {
    h.store
        .list_notifications(instance_id)
        .await
        .unwrap()
        .iter()
        .filter(|n| n.kind == kind)
        .count()
}

fn coverage_rule() -> BusinessRule {
    BusinessRule {
        name: "coverage-confirmed".into(),
        version: 1,
        category: "hr".into(),
        stage: Some("hr".into()),
        blocking: true,
        priority: 1,
        message: "team coverage is not confirmed".into(),
    }
}

// ============================================================
// Happy path scenarios
// ============================================================

#[tokio::test]
async fn vacation_approval_runs_to_completion() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;

    // Stage 1: supervisor task due in 24h.
    let t1 = open_task(&h, instance.id).await;
    assert_eq!(t1.stage_name, "supervisor");
    assert_eq!(t1.assigned_to.as_deref(), Some("sam"));
    assert_eq!(t1.due_at - t1.created_at, Duration::hours(24));
    assert_eq!(notifications_of(&h, instance.id, NotificationKind::Assigned).await, 1);

    let r = act(&h, t1.id, "Approve", "sam").await;
    assert_eq!(r.effect, Effect::AdvanceStage);
    assert_eq!(r.next_stage.as_deref(), Some("planner"));

    // Stage 2: RequestInfo holds the task without moving the stage.
    let t2 = open_task(&h, instance.id).await;
    let r = act(&h, t2.id, "RequestInfo", "pat").await;
    assert_eq!(r.effect, Effect::Hold);
    assert_eq!(r.next_stage.as_deref(), Some("planner"));
    let held = h.engine.get_task(t2.id).await.unwrap();
    assert_eq!(held.status, TaskStatus::InProgress);

    let r = act(&h, t2.id, "ConfirmCoverage", "pat").await;
    assert_eq!(r.next_stage.as_deref(), Some("hr"));

    // Stage 3: FlagIssues rewinds to the planner.
    let t3 = open_task(&h, instance.id).await;
    let r = act(&h, t3.id, "FlagIssues", "hana").await;
    assert_eq!(r.effect, Effect::RewindStage);
    assert_eq!(r.next_stage.as_deref(), Some("planner"));

    let t2b = open_task(&h, instance.id).await;
    assert_eq!(t2b.stage_name, "planner");
    act(&h, t2b.id, "Approve", "pat").await;

    let t3b = open_task(&h, instance.id).await;
    act(&h, t3b.id, "Approve", "hana").await;

    let t4 = open_task(&h, instance.id).await;
    assert_eq!(t4.stage_name, "sign-off");
    let r = act(&h, t4.id, "Approve", "sam").await;
    assert_eq!(r.instance_status, InstanceStatus::Completed);
    assert_eq!(r.next_stage, None);
    assert_eq!(r.next_task_id, None);

    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.current_stage, "sign-off");
    assert!(done.completed_at.is_some());
    assert!(h.store.open_task_for_instance(instance.id).await.unwrap().is_none());

    let trail = h.engine.list_actions(instance.id).await.unwrap();
    let names: Vec<_> = trail.iter().map(|a| a.action_name.as_str()).collect();
    assert_eq!(
        names,
        ["Approve", "RequestInfo", "ConfirmCoverage", "FlagIssues", "Approve", "Approve", "Approve"]
    );
    assert_eq!(trail[2].action_type, ActionType::Approve);
    assert_eq!(trail[3].to_stage.as_deref(), Some("planner"));
    assert_eq!(notifications_of(&h, instance.id, NotificationKind::Completed).await, 1);
}

#[tokio::test]
async fn reject_at_first_stage_cancels_the_instance() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;

    let t1 = open_task(&h, instance.id).await;
    let r = act(&h, t1.id, "Reject", "sam").await;
    assert_eq!(r.instance_status, InstanceStatus::Cancelled);

    let cancelled = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(cancelled.current_stage, "supervisor");
    assert!(cancelled.status_reason.unwrap().contains("rejected at first stage"));
    assert_eq!(h.engine.get_task(t1.id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn complete_effect_override_finishes_early() {
    let h = harness();
    let mut spec = vacation_spec();
    spec.stages[0].effects.insert("Approve".into(), Effect::Complete);
    activate(&h, spec).await;
    let instance = start(&h, "Vacation Approval").await;

    let t1 = open_task(&h, instance.id).await;
    let r = act(&h, t1.id, "Approve", "sam").await;
    assert_eq!(r.effect, Effect::Complete);
    assert_eq!(r.instance_status, InstanceStatus::Completed);
}

#[tokio::test]
async fn action_variables_are_merged() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;

    let t1 = open_task(&h, instance.id).await;
    let mut req = request("Approve", "sam");
    req.variables = Some(json!({ "approvedDays": 5 }));
    h.engine.execute_action(t1.id, req).await.unwrap();

    let inst = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(inst.variables["approvedDays"], 5);
    assert_eq!(inst.variables["assignees"]["planner"], "pat");
}

#[tokio::test]
async fn assigned_notification_is_delivered_through_the_channel() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    start(&h, "Vacation Approval").await;

    let report = h.engine.dispatcher().deliver_due(Utc::now()).await.unwrap();
    assert_eq!(report.sent, 1);
    let sent = h.channel.sent();
    assert_eq!(sent[0].recipient, "sam");
    assert!(sent[0].content.subject.contains("supervisor review"));
}

// ============================================================
// Error paths
// ============================================================

#[tokio::test]
async fn initiate_without_active_definition_is_not_found() {
    let h = harness();
    h.engine.registry().register(vacation_spec()).await.unwrap();

    let err = h
        .engine
        .initiate(
            "Vacation Approval",
            InitiateRequest {
                business_object: BusinessObjectRef {
                    object_type: "vacation".into(),
                    object_id: "1".into(),
                    display_name: "Vacation #1".into(),
                },
                initiator: "alex".into(),
                variables: Value::Null,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn action_on_completed_task_changes_nothing() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;

    let t1 = open_task(&h, instance.id).await;
    act(&h, t1.id, "Approve", "sam").await;
    let before = h.engine.get_instance(instance.id).await.unwrap();

    let err = h
        .engine
        .execute_action(t1.id, request("Approve", "sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    assert_eq!(h.engine.get_instance(instance.id).await.unwrap(), before);
    assert_eq!(h.engine.list_actions(instance.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unpermitted_action_is_rejected() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;
    let t1 = open_task(&h, instance.id).await;

    let err = h
        .engine
        .execute_action(t1.id, request("FlagIssues", "sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.engine.get_task(t1.id).await.unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn racing_writer_gets_conflict() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;
    let t1 = open_task(&h, instance.id).await;

    // Hold the instance lock so the second caller has read the task but
    // waits before touching it.
    let guard = h.engine.locks.lock(instance.id).await;
    let loser = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.execute_action(t1.id, request("Approve", "sam")).await })
    };
    tokio::time::sleep(StdDuration::from_millis(20)).await;

    let winner = TaskUpdate {
        effect: Effect::Hold,
        performer: "sam".into(),
        comments: None,
        delegate_to: None,
    };
    h.engine.tasks().apply(t1.id, &winner, Utc::now()).await.unwrap();
    drop(guard);

    let result = loser.await.unwrap();
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn concurrent_actions_on_one_task_apply_once() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;
    let t1 = open_task(&h, instance.id).await;

    let (a, b) = tokio::join!(
        h.engine.execute_action(t1.id, request("Approve", "sam")),
        h.engine.execute_action(t1.id, request("Approve", "sam")),
    );
    let oks = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1);
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(
        loser,
        Err(EngineError::Conflict(_)) | Err(EngineError::InvalidState(_))
    ));
    assert_eq!(h.engine.list_actions(instance.id).await.unwrap().len(), 1);
}

// ============================================================
// Delegation
// ============================================================

#[tokio::test]
async fn delegation_moves_the_task_not_the_stage() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;
    let t1 = open_task(&h, instance.id).await;

    let err = h
        .engine
        .execute_action(t1.id, request("Delegate", "sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut req = request("Delegate", "sam");
    req.delegate_to = Some("dana".into());
    let r = h.engine.execute_action(t1.id, req).await.unwrap();
    assert_eq!(r.effect, Effect::Reassign);
    assert_eq!(r.next_stage.as_deref(), Some("supervisor"));

    assert_eq!(h.engine.get_task(t1.id).await.unwrap().status, TaskStatus::Delegated);
    let replacement = open_task(&h, instance.id).await;
    assert_eq!(Some(replacement.id), r.next_task_id);
    assert_eq!(replacement.assigned_to.as_deref(), Some("dana"));
    assert_eq!(replacement.delegated_from.as_deref(), Some("sam"));
    assert_eq!(replacement.stage_name, "supervisor");

    let inbox = h
        .engine
        .list_tasks(&TaskFilter {
            assignee: Some("dana".into()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
}

// ============================================================
// Business rules
// ============================================================

#[tokio::test]
async fn blocking_rule_suspends_and_resubmitting_enters_the_blocked_stage() {
    let h = harness();
    h.engine
        .rules()
        .register_rule(coverage_rule(), FieldPresent("/coverage/confirmed".into()))
        .unwrap();
    h.snapshots.set("vacation", "7", json!({ "days": 5 }));
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;

    let t1 = open_task(&h, instance.id).await;
    act(&h, t1.id, "Approve", "sam").await;
    let t2 = open_task(&h, instance.id).await;
    let r = act(&h, t2.id, "Approve", "pat").await;

    // Entering hr is refused: the action is on record, the planner task
    // stays open, and no hr task exists.
    assert_eq!(r.instance_status, InstanceStatus::Suspended);
    assert_eq!(r.next_stage.as_deref(), Some("planner"));
    assert_eq!(r.next_task_id, Some(t2.id));
    assert_eq!(r.violations.len(), 1);
    assert_eq!(open_task(&h, instance.id).await.id, t2.id);

    let suspended = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(suspended.current_stage, "planner");
    assert_eq!(suspended.violations[0].rule, "coverage-confirmed");
    assert!(suspended.status_reason.unwrap().contains("'hr'"));
    let trail = h.engine.list_actions(instance.id).await.unwrap();
    assert_eq!(trail.last().unwrap().to_stage.as_deref(), Some("planner"));

    let escalations: Vec<_> = h
        .store
        .list_notifications(instance.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Escalated)
        .collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].recipient, "hr-owner");
    assert!(escalations[0].body.contains("team coverage is not confirmed"));

    // Only a stage move may be resubmitted while held.
    let err = h
        .engine
        .execute_action(t2.id, request("RequestInfo", "pat"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    // Resubmitting while the rule still fails keeps it held.
    let again = act(&h, t2.id, "Approve", "pat").await;
    assert_eq!(again.instance_status, InstanceStatus::Suspended);
    assert_eq!(open_task(&h, instance.id).await.id, t2.id);

    // Cleared: the same action enters hr, not sign-off.
    h.snapshots
        .set("vacation", "7", json!({ "days": 5, "coverage": { "confirmed": true } }));
    let moved = act(&h, t2.id, "Approve", "pat").await;
    assert_eq!(moved.instance_status, InstanceStatus::Active);
    assert_eq!(moved.next_stage.as_deref(), Some("hr"));
    assert!(moved.violations.is_empty());
    let t3 = open_task(&h, instance.id).await;
    assert_eq!(t3.stage_name, "hr");
    assert_eq!(h.engine.get_task(t2.id).await.unwrap().status, TaskStatus::Completed);

    let resumed = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(resumed.status, InstanceStatus::Active);
    assert!(resumed.status_reason.is_none());
    assert_eq!(h.engine.list_actions(instance.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn blocked_first_stage_opens_on_resume() {
    let h = harness();
    let mut rule = coverage_rule();
    rule.stage = Some("supervisor".into());
    h.engine
        .rules()
        .register_rule(rule, FieldPresent("/coverage/confirmed".into()))
        .unwrap();
    h.snapshots.set("vacation", "7", json!({ "days": 5 }));
    activate(&h, vacation_spec()).await;

    let instance = start(&h, "Vacation Approval").await;
    assert_eq!(instance.status, InstanceStatus::Suspended);
    assert!(h.store.open_task_for_instance(instance.id).await.unwrap().is_none());

    let err = h.engine.resume(instance.id, "hr-owner").await.unwrap_err();
    assert!(matches!(err, EngineError::RuleViolation(ref v) if v.len() == 1));

    h.snapshots
        .set("vacation", "7", json!({ "coverage": { "confirmed": true } }));
    let resumed = h.engine.resume(instance.id, "hr-owner").await.unwrap();
    assert_eq!(resumed.status, InstanceStatus::Active);
    assert_eq!(open_task(&h, instance.id).await.stage_name, "supervisor");
}

#[tokio::test]
async fn missing_snapshot_fails_closed() {
    let h = harness();
    h.engine
        .rules()
        .register_rule(coverage_rule(), FieldPresent("/coverage/confirmed".into()))
        .unwrap();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;

    let t1 = open_task(&h, instance.id).await;
    act(&h, t1.id, "Approve", "sam").await;
    let t2 = open_task(&h, instance.id).await;
    let r = act(&h, t2.id, "Approve", "pat").await;

    assert_eq!(r.instance_status, InstanceStatus::Suspended);
    assert_eq!(r.violations[0].rule, SNAPSHOT_RULE);
}

// ============================================================
// Store failures
// ============================================================

/// `MemoryStore` with switches that make single writes fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_actions: AtomicBool,
    fail_next_instance_update: AtomicBool,
}

fn unavailable() -> DbError {
    DbError::Corrupt("storage unavailable".into())
}

#[async_trait]
impl WorkflowStore for FlakyStore {
    async fn insert_definition(&self, definition: &DefinitionRecord) -> Result<(), DbError> {
        self.inner.insert_definition(definition).await
    }
    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRecord, DbError> {
        self.inner.get_definition(id).await
    }
    async fn definitions_by_name(&self, name: &str) -> Result<Vec<DefinitionRecord>, DbError> {
        self.inner.definitions_by_name(name).await
    }
    async fn list_definitions(&self, category: Option<&str>) -> Result<Vec<DefinitionRecord>, DbError> {
        self.inner.list_definitions(category).await
    }
    async fn set_definition_status(
        &self,
        id: Uuid,
        status: DefinitionStatus,
        at: DateTime<Utc>,
    ) -> Result<DefinitionRecord, DbError> {
        self.inner.set_definition_status(id, status, at).await
    }
    async fn insert_instance(&self, instance: &ProcessInstance) -> Result<(), DbError> {
        self.inner.insert_instance(instance).await
    }
    async fn get_instance(&self, id: Uuid) -> Result<ProcessInstance, DbError> {
        self.inner.get_instance(id).await
    }
    async fn update_instance(&self, instance: &ProcessInstance) -> Result<ProcessInstance, DbError> {
        if self.fail_next_instance_update.swap(false, Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.update_instance(instance).await
    }
    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<ProcessInstance>, DbError> {
        self.inner.list_instances(status).await
    }
    async fn insert_task(&self, task: &WorkflowTask) -> Result<(), DbError> {
        self.inner.insert_task(task).await
    }
    async fn get_task(&self, id: Uuid) -> Result<WorkflowTask, DbError> {
        self.inner.get_task(id).await
    }
    async fn update_task(&self, task: &WorkflowTask) -> Result<WorkflowTask, DbError> {
        self.inner.update_task(task).await
    }
    async fn open_task_for_instance(&self, instance_id: Uuid) -> Result<Option<WorkflowTask>, DbError> {
        self.inner.open_task_for_instance(instance_id).await
    }
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<WorkflowTask>, DbError> {
        self.inner.list_tasks(filter).await
    }
    async fn open_tasks_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowTask>, DbError> {
        self.inner.open_tasks_due_before(cutoff).await
    }
    async fn append_action(&self, action: &TaskAction) -> Result<(), DbError> {
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.append_action(action).await
    }
    async fn record_action(&self, task: &WorkflowTask, action: &TaskAction) -> Result<WorkflowTask, DbError> {
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.record_action(task, action).await
    }
    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<TaskAction>, DbError> {
        self.inner.list_actions(instance_id).await
    }
    async fn insert_notification(&self, notification: &Notification) -> Result<(), DbError> {
        self.inner.insert_notification(notification).await
    }
    async fn get_notification(&self, id: Uuid) -> Result<Notification, DbError> {
        self.inner.get_notification(id).await
    }
    async fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Notification>, DbError> {
        self.inner.claim_due_notifications(now, lease, limit).await
    }
    async fn update_notification(&self, notification: &Notification) -> Result<bool, DbError> {
        self.inner.update_notification(notification).await
    }
    async fn cancel_task_notifications(&self, task_id: Uuid) -> Result<u64, DbError> {
        self.inner.cancel_task_notifications(task_id).await
    }
    async fn list_notifications(&self, instance_id: Uuid) -> Result<Vec<Notification>, DbError> {
        self.inner.list_notifications(instance_id).await
    }
}

fn flaky_harness() -> (Arc<FlakyStore>, Arc<ProcessEngine>) {
    let store = Arc::new(FlakyStore::default());
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), HashMap::new(), DispatcherConfig::default()));
    let engine = Arc::new(ProcessEngine::new(
        store.clone(),
        dispatcher,
        Arc::new(StaticSnapshots::new()),
        Arc::new(RuleValidator::new()),
        EngineConfig::default(),
    ));
    (store, engine)
}

async fn start_on(engine: &ProcessEngine) -> ProcessInstance {
    let def = engine.registry().register(vacation_spec()).await.unwrap();
    engine.registry().activate(def.id).await.unwrap();
    engine
        .initiate(
            "Vacation Approval",
            InitiateRequest {
                business_object: BusinessObjectRef {
                    object_type: "vacation".into(),
                    object_id: "7".into(),
                    display_name: "Vacation #7".into(),
                },
                initiator: "alex".into(),
                variables: json!({}),
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn failed_audit_write_changes_nothing() {
    let (store, engine) = flaky_harness();
    let instance = start_on(&engine).await;
    let t1 = store.open_task_for_instance(instance.id).await.unwrap().unwrap();

    store.fail_actions.store(true, Ordering::SeqCst);
    let err = engine
        .execute_action(t1.id, request("Approve", "sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)), "got {err:?}");

    // Task still open, no audit row, instance where it was.
    assert_eq!(store.get_task(t1.id).await.unwrap().status, TaskStatus::Pending);
    assert!(store.list_actions(instance.id).await.unwrap().is_empty());
    let unchanged = store.get_instance(instance.id).await.unwrap();
    assert_eq!(unchanged.current_stage, "supervisor");
    assert_eq!(unchanged.status, InstanceStatus::Active);

    // Once storage is back the same action goes through.
    store.fail_actions.store(false, Ordering::SeqCst);
    let r = engine.execute_action(t1.id, request("Approve", "sam")).await.unwrap();
    assert_eq!(r.next_stage.as_deref(), Some("planner"));
    assert_eq!(store.list_actions(instance.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn instance_that_cannot_follow_a_recorded_action_is_failed() {
    let (store, engine) = flaky_harness();
    let instance = start_on(&engine).await;
    let t1 = store.open_task_for_instance(instance.id).await.unwrap().unwrap();

    store.fail_next_instance_update.store(true, Ordering::SeqCst);
    let err = engine
        .execute_action(t1.id, request("Approve", "sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)), "got {err:?}");

    let actions = store.list_actions(instance.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    let failed = store.get_instance(instance.id).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.status_reason.unwrap().contains(&actions[0].id.to_string()));
}

// ============================================================
// Administrative transitions
// ============================================================

#[tokio::test]
async fn cancel_closes_task_and_pending_notifications() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;
    let t1 = open_task(&h, instance.id).await;

    let cancelled = h
        .engine
        .cancel(instance.id, "alex", "plans changed")
        .await
        .unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert_eq!(h.engine.get_task(t1.id).await.unwrap().status, TaskStatus::Cancelled);

    let notes = h.engine.list_notifications(instance.id).await.unwrap();
    let assigned = notes
        .iter()
        .find(|n| n.kind == NotificationKind::Assigned)
        .unwrap();
    assert_eq!(assigned.status, NotificationStatus::Cancelled);
    assert!(notes.iter().any(|n| n.kind == NotificationKind::Completed));

    assert!(matches!(
        h.engine.cancel(instance.id, "alex", "again").await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn admin_suspend_blocks_actions_and_resume_keeps_the_open_task() {
    let h = harness();
    activate(&h, vacation_spec()).await;
    let instance = start(&h, "Vacation Approval").await;
    let t1 = open_task(&h, instance.id).await;

    h.engine.suspend(instance.id, "ops", "audit").await.unwrap();
    let err = h
        .engine
        .execute_action(t1.id, request("Approve", "sam"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let resumed = h.engine.resume(instance.id, "ops").await.unwrap();
    assert_eq!(resumed.status, InstanceStatus::Active);
    assert_eq!(open_task(&h, instance.id).await.id, t1.id);
    assert_eq!(
        h.engine
            .list_tasks(&TaskFilter {
                instance_id: Some(instance.id),
                ..TaskFilter::default()
            })
            .await
            .unwrap()
            .len(),
        1
    );
}

// ============================================================
// Escalation scheduler
// ============================================================

fn escalating_spec(escalate_to: Option<&str>) -> DefinitionSpec {
    let mut spec = vacation_spec();
    spec.stages[0].sla_hours = Some(1);
    spec.stages[0].escalation = EscalationPolicy {
        enabled: true,
        escalate_to: escalate_to.map(str::to_string),
        cooldown_minutes: None,
    };
    spec
}

#[tokio::test]
async fn overdue_task_is_escalated_once_per_cooldown() {
    let h = harness();
    activate(&h, escalating_spec(None)).await;
    let instance = start(&h, "Vacation Approval").await;
    let task = open_task(&h, instance.id).await;
    let scheduler = EscalationScheduler::new(Arc::clone(&h.engine), EscalationConfig::default());

    // Not due yet.
    let report = scheduler.tick(task.due_at - Duration::minutes(5)).await.unwrap();
    assert_eq!(report.escalated, 0);

    let overdue = task.due_at + Duration::minutes(1);
    assert_eq!(scheduler.tick(overdue).await.unwrap().escalated, 1);
    assert_eq!(notifications_of(&h, instance.id, NotificationKind::Overdue).await, 1);

    // Same window: suppressed.
    let again = scheduler.tick(overdue + Duration::minutes(1)).await.unwrap();
    assert_eq!((again.escalated, again.skipped), (0, 1));
    assert_eq!(notifications_of(&h, instance.id, NotificationKind::Overdue).await, 1);

    // After the 240 minute cool-down.
    let later = overdue + Duration::minutes(241);
    assert_eq!(scheduler.tick(later).await.unwrap().escalated, 1);
    assert_eq!(notifications_of(&h, instance.id, NotificationKind::Overdue).await, 2);
    assert_eq!(h.engine.get_task(task.id).await.unwrap().escalation_count, 2);
}

#[tokio::test]
async fn overdue_task_is_reassigned_to_escalation_target() {
    let h = harness();
    activate(&h, escalating_spec(Some("director"))).await;
    let instance = start(&h, "Vacation Approval").await;
    let task = open_task(&h, instance.id).await;
    let scheduler = EscalationScheduler::new(Arc::clone(&h.engine), EscalationConfig::default());

    let report = scheduler.tick(task.due_at + Duration::minutes(1)).await.unwrap();
    assert_eq!(report.reassigned, 1);

    assert_eq!(h.engine.get_task(task.id).await.unwrap().status, TaskStatus::Escalated);
    let replacement = open_task(&h, instance.id).await;
    assert_eq!(replacement.assigned_to.as_deref(), Some("director"));
    assert_eq!(replacement.escalation_count, 1);

    let escalated: Vec<_> = h
        .store
        .list_notifications(instance.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Escalated)
        .collect();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].recipient, "director");
    assert_eq!(escalated[0].task_id, Some(replacement.id));

    // The target can act on it.
    let r = act(&h, replacement.id, "Approve", "director").await;
    assert_eq!(r.next_stage.as_deref(), Some("planner"));
}

#[tokio::test]
async fn suspended_instances_are_not_escalated() {
    let h = harness();
    activate(&h, escalating_spec(None)).await;
    let instance = start(&h, "Vacation Approval").await;
    let task = open_task(&h, instance.id).await;
    h.engine.suspend(instance.id, "ops", "on hold").await.unwrap();

    let scheduler = EscalationScheduler::new(Arc::clone(&h.engine), EscalationConfig::default());
    let report = scheduler.tick(task.due_at + Duration::hours(1)).await.unwrap();
    assert_eq!((report.escalated, report.skipped), (0, 1));
}

#[tokio::test]
async fn due_reminder_is_sent_once() {
    let h = harness();
    let mut spec = vacation_spec();
    spec.notification_policy.reminder_hours = Some(2);
    activate(&h, spec).await;
    let instance = start(&h, "Vacation Approval").await;
    let task = open_task(&h, instance.id).await;
    let scheduler = EscalationScheduler::new(Arc::clone(&h.engine), EscalationConfig::default());

    assert_eq!(scheduler.tick(task.due_at - Duration::hours(5)).await.unwrap().reminded, 0);
    assert_eq!(scheduler.tick(task.due_at - Duration::hours(1)).await.unwrap().reminded, 1);
    assert_eq!(scheduler.tick(task.due_at - Duration::minutes(30)).await.unwrap().reminded, 0);
    assert_eq!(notifications_of(&h, instance.id, NotificationKind::Due).await, 1);
}

#[tokio::test]
async fn scheduler_stops_on_shutdown() {
    let h = harness();
    let scheduler = Arc::new(EscalationScheduler::new(
        Arc::clone(&h.engine),
        EscalationConfig {
            tick: StdDuration::from_millis(10),
            ..EscalationConfig::default()
        },
    ));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler.run(rx));

    tokio::time::sleep(StdDuration::from_millis(30)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
