use uuid::Uuid;

use super::conditions::FlatConditions;
use super::diff::ActionDiff;
use super::types::{ActionSpec, ActionType, FieldValue, NewRuleDefinition, RuleDefinitionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    Insert,
    Update,
}

/// The rule row as the plan writes it. `None` for `name`, `automate` or
/// `run_on_threads` keeps the stored value on update; condition columns are
/// always written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleUpsert {
    pub mode: UpsertMode,
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub automate: Option<bool>,
    pub run_on_threads: Option<bool>,
    pub conditions: FlatConditions,
}

/// Column values for a new action row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAction {
    pub action_type: ActionType,
    pub label: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub url: Option<String>,
}

impl From<&ActionSpec> for NewAction {
    fn from(spec: &ActionSpec) -> Self {
        let value = |field: &Option<FieldValue>| ActionSpec::value_of(field).map(str::to_string);
        Self {
            action_type: spec.action_type,
            label: value(&spec.label),
            subject: value(&spec.subject),
            content: value(&spec.content),
            to: value(&spec.to),
            cc: value(&spec.cc),
            bcc: value(&spec.bcc),
            url: value(&spec.url),
        }
    }
}

/// Field changes for an existing action. The outer `Option` is `None` when the
/// column should be left as stored, `Some(None)` when it should be cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPatch {
    pub id: String,
    pub action_type: ActionType,
    pub label: Option<Option<String>>,
    pub subject: Option<Option<String>>,
    pub content: Option<Option<String>>,
    pub to: Option<Option<String>>,
    pub cc: Option<Option<String>>,
    pub bcc: Option<Option<String>>,
    pub url: Option<Option<String>>,
}

impl ActionPatch {
    fn from_spec(id: String, spec: &ActionSpec) -> Self {
        let patch = |field: &Option<FieldValue>| field.as_ref().map(|holder| holder.value.clone());
        Self {
            id,
            action_type: spec.action_type,
            label: patch(&spec.label),
            subject: patch(&spec.subject),
            content: patch(&spec.content),
            to: patch(&spec.to),
            cc: patch(&spec.cc),
            bcc: patch(&spec.bcc),
            url: patch(&spec.url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    UpsertRule(RuleUpsert),
    DeleteActions {
        rule_id: String,
        ids: Vec<String>,
    },
    UpdateActions {
        rule_id: String,
        patches: Vec<ActionPatch>,
    },
    CreateActions {
        rule_id: String,
        actions: Vec<NewAction>,
    },
}

/// Ordered writes that must be applied as one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub rule_id: String,
    pub ops: Vec<WriteOp>,
}

impl WritePlan {
    pub fn kind(&self) -> UpsertMode {
        self.ops
            .iter()
            .find_map(|op| match op {
                WriteOp::UpsertRule(upsert) => Some(upsert.mode),
                _ => None,
            })
            .unwrap_or(UpsertMode::Update)
    }
}

/// Plan a new rule: insert the row under a fresh id, then its actions.
pub fn plan_create(
    user_id: &str,
    definition: &NewRuleDefinition,
    conditions: FlatConditions,
) -> WritePlan {
    let rule_id = Uuid::new_v4().to_string();
    let mut ops = vec![WriteOp::UpsertRule(RuleUpsert {
        mode: UpsertMode::Insert,
        id: rule_id.clone(),
        user_id: user_id.to_string(),
        name: Some(definition.name.clone()),
        automate: definition.automate,
        run_on_threads: definition.run_on_threads,
        conditions,
    })];

    if !definition.actions.is_empty() {
        ops.push(WriteOp::CreateActions {
            rule_id: rule_id.clone(),
            actions: definition.actions.iter().map(NewAction::from).collect(),
        });
    }

    WritePlan { rule_id, ops }
}

/// Plan an update of an existing rule: row first, then deletes, updates and
/// creates, so a removed action never collides with its replacement.
pub fn plan_update(
    user_id: &str,
    definition: &RuleDefinitionUpdate,
    conditions: FlatConditions,
    diff: ActionDiff,
) -> WritePlan {
    let rule_id = definition.id.clone();
    let name = definition
        .name
        .as_ref()
        .filter(|name| !name.is_empty())
        .cloned();

    let mut ops = vec![WriteOp::UpsertRule(RuleUpsert {
        mode: UpsertMode::Update,
        id: rule_id.clone(),
        user_id: user_id.to_string(),
        name,
        automate: definition.automate,
        run_on_threads: definition.run_on_threads,
        conditions,
    })];

    let ActionDiff {
        to_delete,
        to_update,
        to_create,
    } = diff;

    if !to_delete.is_empty() {
        ops.push(WriteOp::DeleteActions {
            rule_id: rule_id.clone(),
            ids: to_delete,
        });
    }

    let patches: Vec<ActionPatch> = to_update
        .iter()
        .filter_map(|spec| {
            spec.id
                .clone()
                .map(|id| ActionPatch::from_spec(id, spec))
        })
        .collect();
    if !patches.is_empty() {
        ops.push(WriteOp::UpdateActions {
            rule_id: rule_id.clone(),
            patches,
        });
    }

    if !to_create.is_empty() {
        ops.push(WriteOp::CreateActions {
            rule_id: rule_id.clone(),
            actions: to_create.iter().map(NewAction::from).collect(),
        });
    }

    WritePlan { rule_id, ops }
}
