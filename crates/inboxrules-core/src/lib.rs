pub mod config;
pub mod db;
pub mod migrations;
pub mod rules;
pub mod telemetry;

pub use config::Config;
pub use db::Database;
pub use rules::{
    Action, ActionSpec, ActionType, Caller, Condition, NewRuleDefinition, Rule, RuleDefinitionUpdate,
    RuleError, RuleInstructionsUpdate, RuleRepository, RuleService, RuleStore,
};
pub use telemetry::{TelemetryError, TelemetryGuard, init_telemetry};
