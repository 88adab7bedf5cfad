//! Escalation Scheduler.
//!
//! On every tick, open tasks past their due date are escalated (at most
//! once per cool-down window), and tasks approaching their due date get a
//! single reminder when the definition asks for one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::models::{InstanceStatus, NotificationKind, ProcessInstance, WorkflowTask};

use crate::machine::ProcessEngine;
use crate::models::ProcessDefinition;
use crate::EngineError;

#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Time between two scans.
    pub tick: Duration,
    /// Upper bound for one scan.
    pub tick_timeout: Duration,
    /// How far ahead of `now` tasks are looked at for `Due` reminders.
    pub reminder_horizon: chrono::Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            tick_timeout: Duration::from_secs(30),
            reminder_horizon: chrono::Duration::hours(72),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Escalated in place (counter bumped, `Overdue` sent).
    pub escalated: usize,
    /// Reassigned to the escalation target.
    pub reassigned: usize,
    pub reminded: usize,
    /// Overdue but cooling down, disabled, or not on an active instance.
    pub skipped: usize,
}

pub struct EscalationScheduler {
    engine: Arc<ProcessEngine>,
    config: EscalationConfig,
}

fn cooling_down(task: &WorkflowTask, now: DateTime<Utc>) -> bool {
    task.last_escalated_at.map_or(false, |last| {
        now < last + chrono::Duration::minutes(i64::from(task.escalation_cooldown_minutes))
    })
}

impl EscalationScheduler {
    pub fn new(engine: Arc<ProcessEngine>, config: EscalationConfig) -> Self {
        Self { engine, config }
    }

    /// One scan at `now`. Failures on single tasks are logged and left for
    /// the next tick.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        let mut definitions: HashMap<Uuid, Option<ProcessDefinition>> = HashMap::new();

        let candidates = self
            .engine
            .store
            .open_tasks_due_before(now + self.config.reminder_horizon)
            .await?;

        for task in candidates {
            let overdue = task.due_at <= now;
            if overdue && (!task.escalation_enabled || cooling_down(&task, now)) {
                report.skipped += 1;
                continue;
            }
            if !overdue && task.reminder_sent {
                continue;
            }

            let instance = match self.engine.store.get_instance(task.instance_id).await {
                Ok(instance) => instance,
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "skipping task without instance");
                    continue;
                }
            };
            if instance.status != InstanceStatus::Active {
                if overdue {
                    report.skipped += 1;
                }
                continue;
            }

            let definition = match definitions.get(&instance.definition_id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = self.engine.registry.get_by_id(instance.definition_id).await.ok();
                    definitions.insert(instance.definition_id, loaded.clone());
                    loaded
                }
            };
            let Some(definition) = definition else {
                warn!(task_id = %task.id, "skipping task whose definition is gone");
                continue;
            };

            let outcome = if overdue {
                self.escalate(&definition, &instance, task, now, &mut report).await
            } else {
                self.remind(&definition, &instance, task, now, &mut report).await
            };
            if let Err(err) = outcome {
                match err {
                    EngineError::Conflict(_) | EngineError::InvalidState(_) => {
                        debug!(error = %err, "task moved during scan");
                    }
                    other => warn!(error = %other, "escalation step failed"),
                }
            }
        }

        if report != TickReport::default() {
            info!(
                escalated = report.escalated,
                reassigned = report.reassigned,
                reminded = report.reminded,
                skipped = report.skipped,
                "escalation tick"
            );
        }
        Ok(report)
    }

    async fn escalate(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        task: WorkflowTask,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        let target = task
            .escalated_to
            .clone()
            .filter(|target| task.assigned_to.as_deref() != Some(target.as_str()));

        match target {
            Some(target) => {
                let _guard = self.engine.locks.lock(instance.id).await;
                let current = self.engine.tasks.get(task.id).await?;
                if current.version != task.version {
                    return Err(EngineError::Conflict(format!("task {} moved", task.id)));
                }
                let replacement = self.engine.tasks.escalate_to(current, &target, now).await?;
                info!(task_id = %task.id, replacement = %replacement.id, %target, "overdue task reassigned");
                self.engine
                    .notify_task(
                        definition,
                        instance,
                        &replacement,
                        NotificationKind::Escalated,
                        Some(format!(
                            "Escalated from {} after the due date passed.",
                            task.recipient()
                        )),
                    )
                    .await;
                report.reassigned += 1;
            }
            None => {
                let task = self.engine.tasks.record_escalation(task, now).await?;
                info!(task_id = %task.id, count = task.escalation_count, "overdue task escalated");
                self.engine
                    .notify_task(definition, instance, &task, NotificationKind::Overdue, None)
                    .await;
                report.escalated += 1;
            }
        }
        Ok(())
    }

    async fn remind(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        task: WorkflowTask,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        let Some(hours) = definition.notification_policy.reminder_hours else {
            return Ok(());
        };
        if task.due_at - now > chrono::Duration::hours(i64::from(hours)) {
            return Ok(());
        }
        let task = self.engine.tasks.mark_reminded(task).await?;
        self.engine
            .notify_task(definition, instance, &task, NotificationKind::Due, None)
            .await;
        report.reminded += 1;
        Ok(())
    }

    /// Tick until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick = ?self.config.tick, "escalation scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match tokio::time::timeout(self.config.tick_timeout, self.tick(Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!(error = %err, "escalation scan failed"),
                        Err(_) => warn!(timeout = ?self.config.tick_timeout, "escalation scan timed out"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("escalation scheduler stopped");
    }
}
