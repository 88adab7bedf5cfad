//! `engine` crate: definition registry, business rules, task manager, the
//! process state machine and the escalation scheduler.

pub mod error;
pub mod escalation;
pub mod locks;
pub mod machine;
pub mod models;
pub mod registry;
pub mod rules;
pub mod tasks;
pub mod validate;

pub use error::EngineError;
pub use escalation::{EscalationConfig, EscalationScheduler, TickReport};
pub use locks::InstanceLocks;
pub use machine::{ActionRequest, ActionResult, EngineConfig, InitiateRequest, ProcessEngine};
pub use models::{DefinitionSpec, EscalationPolicy, NotificationPolicy, ProcessDefinition, Stage, TaskTemplate};
pub use registry::DefinitionRegistry;
pub use rules::{
    BusinessRule, FieldAtMost, FieldEquals, FieldPresent, RuleCheck, RuleConfig, RulePredicate, RuleReport,
    RuleValidator,
};
pub use tasks::{TaskManager, TaskUpdate};
pub use validate::validate_definition;

#[cfg(test)]
mod engine_tests;
