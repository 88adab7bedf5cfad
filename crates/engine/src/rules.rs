//! Business Rule Validator.
//!
//! Rules are named, versioned predicates over a business-object snapshot.
//! A rule is scoped to a process category and, optionally, one stage.
//! Blocking violations stop a stage from opening; the rest are warnings.
//!
//! Predicates are Rust code. Deployments that cannot compile their own can
//! load [`RuleConfig`] entries, which bind a rule to one of the built-in
//! field checks.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use db::models::Violation;

use crate::models::ProcessDefinition;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A rule body. `Ok(true)` passes; `Err` means the predicate could not
/// decide and is handled as a failure.
pub trait RulePredicate: Send + Sync {
    fn evaluate(&self, snapshot: &Value) -> Result<bool, String>;
}

impl<F> RulePredicate for F
where
    F: Fn(&Value) -> Result<bool, String> + Send + Sync,
{
    fn evaluate(&self, snapshot: &Value) -> Result<bool, String> {
        self(snapshot)
    }
}

/// Passes when the JSON pointer resolves to a non-null value.
pub struct FieldPresent(pub String);

impl RulePredicate for FieldPresent {
    fn evaluate(&self, snapshot: &Value) -> Result<bool, String> {
        Ok(snapshot.pointer(&self.0).map_or(false, |v| !v.is_null()))
    }
}

/// Passes when the JSON pointer resolves to exactly `value`.
pub struct FieldEquals(pub String, pub Value);

impl RulePredicate for FieldEquals {
    fn evaluate(&self, snapshot: &Value) -> Result<bool, String> {
        Ok(snapshot.pointer(&self.0) == Some(&self.1))
    }
}

/// Passes when the JSON pointer resolves to a number `<= limit`.
pub struct FieldAtMost(pub String, pub f64);

impl RulePredicate for FieldAtMost {
    fn evaluate(&self, snapshot: &Value) -> Result<bool, String> {
        match snapshot.pointer(&self.0) {
            Some(v) => v
                .as_f64()
                .map(|n| n <= self.1)
                .ok_or_else(|| format!("{} is not a number", self.0)),
            None => Err(format!("{} is missing", self.0)),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessRule {
    pub name: String,
    pub version: u32,
    pub category: String,
    /// Only evaluated at this stage when set.
    pub stage: Option<String>,
    pub blocking: bool,
    /// Lower runs first.
    pub priority: i32,
    pub message: String,
}

/// Built-in field check a configured rule runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuleCheck {
    /// See [`FieldPresent`].
    Present { field: String },
    /// See [`FieldEquals`].
    Equals { field: String, value: Value },
    /// See [`FieldAtMost`].
    AtMost { field: String, limit: f64 },
}

/// One entry of a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub name: String,
    #[serde(default = "first_version")]
    pub version: u32,
    pub category: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default = "blocking_by_default")]
    pub blocking: bool,
    #[serde(default)]
    pub priority: i32,
    pub message: String,
    pub check: RuleCheck,
}

fn first_version() -> u32 {
    1
}

fn blocking_by_default() -> bool {
    true
}

struct RegisteredRule {
    rule: BusinessRule,
    predicate: Arc<dyn RulePredicate>,
    active: bool,
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleReport {
    /// False when any blocking rule failed.
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl RuleReport {
    pub fn passed() -> Self {
        Self {
            ok: true,
            violations: Vec::new(),
        }
    }

    pub fn blocking(&self) -> Vec<Violation> {
        self.violations.iter().filter(|v| v.blocking).cloned().collect()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| !v.blocking)
    }
}

#[derive(Default)]
pub struct RuleValidator {
    rules: RwLock<Vec<RegisteredRule>>,
}

impl RuleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule version.
    ///
    /// # Errors
    /// [`EngineError::Conflict`] when `(name, version)` already exists.
    pub fn register_rule(
        &self,
        rule: BusinessRule,
        predicate: impl RulePredicate + 'static,
    ) -> Result<(), EngineError> {
        let mut rules = self
            .rules
            .write()
            .map_err(|_| EngineError::InvalidState("rule registry lock poisoned".into()))?;
        if rules
            .iter()
            .any(|r| r.rule.name == rule.name && r.rule.version == rule.version)
        {
            return Err(EngineError::Conflict(format!(
                "rule '{}' version {} already registered",
                rule.name, rule.version
            )));
        }
        debug!(rule = %rule.name, version = rule.version, "rule registered");
        rules.push(RegisteredRule {
            rule,
            predicate: Arc::new(predicate),
            active: true,
        });
        Ok(())
    }

    /// Register every configured rule. Stops at the first one that fails.
    pub fn register_config(&self, configs: Vec<RuleConfig>) -> Result<usize, EngineError> {
        let count = configs.len();
        for config in configs {
            let rule = BusinessRule {
                name: config.name,
                version: config.version,
                category: config.category,
                stage: config.stage,
                blocking: config.blocking,
                priority: config.priority,
                message: config.message,
            };
            match config.check {
                RuleCheck::Present { field } => self.register_rule(rule, FieldPresent(field))?,
                RuleCheck::Equals { field, value } => self.register_rule(rule, FieldEquals(field, value))?,
                RuleCheck::AtMost { field, limit } => self.register_rule(rule, FieldAtMost(field, limit))?,
            }
        }
        Ok(count)
    }

    /// Whether an active version of `name` exists.
    pub fn is_registered(&self, name: &str) -> bool {
        self.rules
            .read()
            .map(|rules| rules.iter().any(|r| r.active && r.rule.name == name))
            .unwrap_or(false)
    }

    /// Fail on the first name in `names` with no active rule behind it.
    pub fn ensure_known(&self, names: &[String]) -> Result<(), EngineError> {
        match names.iter().find(|name| !self.is_registered(name)) {
            Some(unknown) => Err(EngineError::Validation(format!(
                "business rule '{unknown}' is not registered"
            ))),
            None => Ok(()),
        }
    }

    /// Deactivate every version of `name`. Returns how many were active.
    pub fn deactivate(&self, name: &str) -> usize {
        let Ok(mut rules) = self.rules.write() else {
            return 0;
        };
        let mut count = 0;
        for r in rules.iter_mut().filter(|r| r.rule.name == name && r.active) {
            r.active = false;
            count += 1;
        }
        count
    }

    /// Latest active version of every rule accepted by `in_scope`, in
    /// ascending priority order.
    fn select(&self, in_scope: impl Fn(&BusinessRule) -> bool) -> Vec<(BusinessRule, Arc<dyn RulePredicate>)> {
        let Ok(rules) = self.rules.read() else {
            return Vec::new();
        };
        let mut latest: Vec<&RegisteredRule> = Vec::new();
        for candidate in rules.iter().filter(|r| r.active && in_scope(&r.rule)) {
            match latest.iter_mut().find(|r| r.rule.name == candidate.rule.name) {
                Some(slot) if slot.rule.version < candidate.rule.version => *slot = candidate,
                Some(_) => {}
                None => latest.push(candidate),
            }
        }
        let mut selected: Vec<_> = latest
            .into_iter()
            .map(|r| (r.rule.clone(), Arc::clone(&r.predicate)))
            .collect();
        selected.sort_by(|a, b| a.0.priority.cmp(&b.0.priority).then_with(|| a.0.name.cmp(&b.0.name)));
        selected
    }

    fn stage_matches(rule: &BusinessRule, stage: &str) -> bool {
        rule.stage.as_deref().map_or(true, |s| s == stage)
    }

    /// Rules of `category` that apply at `stage`.
    pub fn validate(&self, category: &str, stage: &str, snapshot: &Value) -> RuleReport {
        let selected = self.select(|r| r.category == category && Self::stage_matches(r, stage));
        evaluate(selected, snapshot)
    }

    /// Category-scoped rules plus the ones `definition` names explicitly.
    pub fn validate_for(&self, definition: &ProcessDefinition, stage: &str, snapshot: &Value) -> RuleReport {
        evaluate(self.rules_for(definition, stage), snapshot)
    }

    /// Whether [`validate_for`](Self::validate_for) would evaluate anything.
    pub fn has_rules_for(&self, definition: &ProcessDefinition, stage: &str) -> bool {
        !self.rules_for(definition, stage).is_empty()
    }

    fn rules_for(&self, definition: &ProcessDefinition, stage: &str) -> Vec<(BusinessRule, Arc<dyn RulePredicate>)> {
        let named: HashSet<&str> = definition.business_rules.iter().map(String::as_str).collect();
        self.select(|r| {
            (r.category == definition.category || named.contains(r.name.as_str()))
                && Self::stage_matches(r, stage)
        })
    }
}

fn evaluate(selected: Vec<(BusinessRule, Arc<dyn RulePredicate>)>, snapshot: &Value) -> RuleReport {
    let mut report = RuleReport::passed();
    for (rule, predicate) in selected {
        let message = match predicate.evaluate(snapshot) {
            Ok(true) => continue,
            Ok(false) => rule.message.clone(),
            Err(reason) => format!("{} ({reason})", rule.message),
        };
        if rule.blocking {
            report.ok = false;
        }
        report.violations.push(Violation {
            rule: rule.name,
            rule_version: rule.version,
            priority: rule.priority,
            blocking: rule.blocking,
            message,
        });
    }
    report
}
