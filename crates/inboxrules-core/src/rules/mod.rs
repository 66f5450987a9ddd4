pub mod conditions;
pub mod diff;
pub mod plan;
pub mod repositories;
pub mod service;
pub mod types;

pub use conditions::{
    CategoryFilterType, Condition, ConditionError, FlatConditions, LeafCondition,
    LogicalCondition, LogicalOperator, flatten_conditions, flatten_optional, validate_condition,
};
pub use diff::{ActionDiff, diff_actions};
pub use plan::{
    ActionPatch, NewAction, RuleUpsert, UpsertMode, WriteOp, WritePlan, plan_create, plan_update,
};
pub use repositories::{RuleRepository, RuleStore, RuleStoreError, UniqueField};
pub use service::{Caller, RuleError, RuleService};
pub use types::{
    Action, ActionSpec, ActionType, FieldValue, NewRuleDefinition, Rule, RuleDefinitionUpdate,
    RuleInstructionsUpdate,
};
