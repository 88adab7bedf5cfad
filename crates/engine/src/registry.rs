//! Process Definition Registry: versioned templates, immutable once active.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use db::models::DefinitionStatus;
use db::WorkflowStore;

use crate::models::{DefinitionSpec, ProcessDefinition};
use crate::rules::RuleValidator;
use crate::validate::validate_definition;
use crate::EngineError;

#[derive(Clone)]
pub struct DefinitionRegistry {
    store: Arc<dyn WorkflowStore>,
    rules: Arc<RuleValidator>,
}

impl DefinitionRegistry {
    pub fn new(store: Arc<dyn WorkflowStore>, rules: Arc<RuleValidator>) -> Self {
        Self { store, rules }
    }

    /// Validate and store a new `Draft` version of `spec.name`.
    ///
    /// The version is one past the highest existing version of the name.
    /// Every rule the definition names must already be registered.
    #[instrument(skip(self, spec), fields(process = %spec.name))]
    pub async fn register(&self, spec: DefinitionSpec) -> Result<ProcessDefinition, EngineError> {
        validate_definition(&spec)?;
        self.rules.ensure_known(&spec.business_rules)?;

        let existing = self.store.definitions_by_name(&spec.name).await?;
        let version = existing.iter().map(|d| d.version).max().unwrap_or(0) + 1;

        let record = ProcessDefinition::new_record(&spec, version, Utc::now())?;
        self.store.insert_definition(&record).await?;
        info!(id = %record.id, version, "definition registered");

        ProcessDefinition::try_from(record)
    }

    /// Make a `Draft` (or `Suspended`) version the active one.
    ///
    /// # Errors
    /// [`EngineError::Conflict`] when another version of the name is active;
    /// it has to be deprecated first.
    #[instrument(skip(self))]
    pub async fn activate(&self, id: Uuid) -> Result<ProcessDefinition, EngineError> {
        let current = self.get_by_id(id).await?;
        match current.status {
            DefinitionStatus::Active => return Ok(current),
            DefinitionStatus::Draft | DefinitionStatus::Suspended => {}
            DefinitionStatus::Deprecated => {
                return Err(EngineError::InvalidState(format!(
                    "'{}' version {} is deprecated",
                    current.name, current.version
                )))
            }
        }
        let record = self
            .store
            .set_definition_status(id, DefinitionStatus::Active, Utc::now())
            .await?;
        info!(process = %record.name, version = record.version, "definition activated");
        ProcessDefinition::try_from(record)
    }

    /// `Active | Suspended -> Deprecated`.
    #[instrument(skip(self))]
    pub async fn deprecate(&self, id: Uuid) -> Result<ProcessDefinition, EngineError> {
        self.transition(
            id,
            &[DefinitionStatus::Active, DefinitionStatus::Suspended],
            DefinitionStatus::Deprecated,
        )
        .await
    }

    /// `Active -> Suspended`: no new instances, running ones continue.
    #[instrument(skip(self))]
    pub async fn suspend(&self, id: Uuid) -> Result<ProcessDefinition, EngineError> {
        self.transition(id, &[DefinitionStatus::Active], DefinitionStatus::Suspended)
            .await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[DefinitionStatus],
        to: DefinitionStatus,
    ) -> Result<ProcessDefinition, EngineError> {
        let current = self.get_by_id(id).await?;
        if !from.contains(&current.status) {
            return Err(EngineError::InvalidState(format!(
                "'{}' version {} is {} and cannot become {}",
                current.name, current.version, current.status, to
            )));
        }
        let record = self.store.set_definition_status(id, to, Utc::now()).await?;
        info!(process = %record.name, version = record.version, status = %to, "definition status changed");
        ProcessDefinition::try_from(record)
    }

    /// A specific version, or the active one when `version` is `None`.
    pub async fn get(&self, name: &str, version: Option<i32>) -> Result<ProcessDefinition, EngineError> {
        let versions = self.store.definitions_by_name(name).await?;
        let found = match version {
            Some(v) => versions.into_iter().find(|d| d.version == v),
            None => versions
                .into_iter()
                .rev()
                .find(|d| d.status == DefinitionStatus::Active),
        };
        match found {
            Some(record) => ProcessDefinition::try_from(record),
            None => Err(EngineError::NotFound(match version {
                Some(v) => format!("definition '{name}' version {v}"),
                None => format!("active definition '{name}'"),
            })),
        }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<ProcessDefinition, EngineError> {
        ProcessDefinition::try_from(self.store.get_definition(id).await?)
    }

    pub async fn list(&self, category: Option<&str>) -> Result<Vec<ProcessDefinition>, EngineError> {
        self.store
            .list_definitions(category)
            .await?
            .into_iter()
            .map(ProcessDefinition::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscalationPolicy, NotificationPolicy, Stage, TaskTemplate};
    use db::MemoryStore;

    fn spec(name: &str) -> DefinitionSpec {
        DefinitionSpec {
            name: name.into(),
            category: "hr".into(),
            description: String::new(),
            stages: vec![Stage {
                order: 1,
                name: "review".into(),
                task: TaskTemplate {
                    name: "Review".into(),
                    description: String::new(),
                    kind: "approval".into(),
                },
                role: "manager".into(),
                permitted_actions: vec!["Approve".into()],
                action_types: Default::default(),
                effects: Default::default(),
                assignee: None,
                sla_hours: None,
                escalation: EscalationPolicy::default(),
            }],
            roles: Default::default(),
            business_rules: vec![],
            notification_policy: NotificationPolicy::default(),
        }
    }

    fn registry() -> DefinitionRegistry {
        DefinitionRegistry::new(Arc::new(MemoryStore::new()), Arc::new(RuleValidator::new()))
    }

    #[tokio::test]
    async fn versions_increment_per_name() {
        let reg = registry();
        let v1 = reg.register(spec("Leave")).await.unwrap();
        let v2 = reg.register(spec("Leave")).await.unwrap();
        let other = reg.register(spec("Expense")).await.unwrap();

        assert_eq!((v1.version, v2.version, other.version), (1, 2, 1));
        assert_eq!(v1.status, DefinitionStatus::Draft);
    }

    #[tokio::test]
    async fn second_active_version_conflicts_until_first_is_deprecated() {
        let reg = registry();
        let v1 = reg.register(spec("Leave")).await.unwrap();
        let v2 = reg.register(spec("Leave")).await.unwrap();

        reg.activate(v1.id).await.unwrap();
        assert!(matches!(reg.activate(v2.id).await, Err(EngineError::Conflict(_))));

        reg.deprecate(v1.id).await.unwrap();
        let active = reg.activate(v2.id).await.unwrap();
        assert_eq!(active.status, DefinitionStatus::Active);
        assert!(active.activated_at.is_some());
    }

    #[tokio::test]
    async fn get_without_version_returns_the_active_one() {
        let reg = registry();
        let v1 = reg.register(spec("Leave")).await.unwrap();
        reg.register(spec("Leave")).await.unwrap();

        assert!(matches!(reg.get("Leave", None).await, Err(EngineError::NotFound(_))));

        reg.activate(v1.id).await.unwrap();
        assert_eq!(reg.get("Leave", None).await.unwrap().version, 1);
        assert_eq!(reg.get("Leave", Some(2)).await.unwrap().version, 2);
        assert!(matches!(reg.get("Leave", Some(9)).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_definitions_are_not_stored() {
        let reg = registry();
        let mut bad = spec("Leave");
        bad.stages.clear();
        assert!(matches!(reg.register(bad).await, Err(EngineError::Validation(_))));
        assert!(reg.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_transitions_are_guarded() {
        let reg = registry();
        let v1 = reg.register(spec("Leave")).await.unwrap();

        assert!(matches!(reg.suspend(v1.id).await, Err(EngineError::InvalidState(_))));
        reg.activate(v1.id).await.unwrap();
        assert_eq!(reg.suspend(v1.id).await.unwrap().status, DefinitionStatus::Suspended);
        assert_eq!(reg.deprecate(v1.id).await.unwrap().status, DefinitionStatus::Deprecated);
        assert!(matches!(reg.activate(v1.id).await, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn list_filters_by_category() {
        let reg = registry();
        reg.register(spec("Leave")).await.unwrap();
        let mut expense = spec("Expense");
        expense.category = "finance".into();
        reg.register(expense).await.unwrap();

        let hr = reg.list(Some("hr")).await.unwrap();
        assert_eq!(hr.len(), 1);
        assert_eq!(hr[0].name, "Leave");
        assert_eq!(reg.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_rule_names_are_rejected() {
        let rules = Arc::new(RuleValidator::new());
        let reg = DefinitionRegistry::new(Arc::new(MemoryStore::new()), Arc::clone(&rules));
        let mut leave = spec("Leave");
        leave.business_rules = vec!["coverage-confirmed".into()];

        let err = reg.register(leave.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("coverage-confirmed")));
        assert!(reg.list(None).await.unwrap().is_empty());

        rules
            .register_rule(
                crate::rules::BusinessRule {
                    name: "coverage-confirmed".into(),
                    version: 1,
                    category: "hr".into(),
                    stage: None,
                    blocking: true,
                    priority: 1,
                    message: "coverage missing".into(),
                },
                crate::rules::FieldPresent("/coverage".into()),
            )
            .unwrap();
        assert_eq!(reg.register(leave).await.unwrap().business_rules, ["coverage-confirmed"]);
    }
}
