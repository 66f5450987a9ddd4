use thiserror::Error;
use tracing::{Instrument, error, info, info_span};

use crate::config::{DEFAULT_MAX_RULE_NAME_LENGTH, RulesConfig};

use super::conditions::{Condition, flatten_optional, validate_condition};
use super::diff::diff_actions;
use super::plan::{plan_create, plan_update};
use super::repositories::{RuleStore, RuleStoreError, UniqueField};
use super::types::{
    ActionSpec, ActionType, NewRuleDefinition, Rule, RuleDefinitionUpdate, RuleInstructionsUpdate,
};

const CREATE_FAILED: &str = "Error creating rule.";
const UPDATE_FAILED: &str = "Error updating rule.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("Not logged in")]
    NotAuthenticated,
    #[error("{0}")]
    ValidationFailed(String),
    #[error("Rule not found: {0}")]
    NotFound(String),
    #[error("Rule name already exists")]
    DuplicateName,
    #[error("Group already has a rule. Please use the existing rule.")]
    DuplicateGroupBinding,
    #[error("{0}")]
    PersistenceFailed(String),
}

/// The authenticated user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Creates and reconciles rule definitions on behalf of a caller.
#[derive(Clone)]
pub struct RuleService<S> {
    store: S,
    max_name_length: usize,
}

impl<S: RuleStore> RuleService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_name_length: DEFAULT_MAX_RULE_NAME_LENGTH,
        }
    }

    pub fn with_config(store: S, config: &RulesConfig) -> Self {
        Self {
            store,
            max_name_length: config.max_name_length,
        }
    }

    pub async fn create_rule(
        &self,
        caller: Option<&Caller>,
        body: &NewRuleDefinition,
    ) -> Result<Rule, RuleError> {
        let caller = authenticate(caller)?;
        let span = info_span!("createRule", user_id = %caller.user_id);

        async {
            self.validate_name(Some(&body.name), true)?;
            validate_definition(body.conditions.as_ref(), &body.actions)?;

            let conditions = flatten_optional(body.conditions.as_ref());
            let plan = plan_create(&caller.user_id, body, conditions);
            self.store
                .apply_plan(&plan)
                .await
                .map_err(|err| write_error(err, CREATE_FAILED))?;

            let rule = self
                .store
                .get_rule(&caller.user_id, &plan.rule_id)
                .await
                .map_err(|err| persistence_error(err, CREATE_FAILED))?;
            info!(rule_id = %rule.id, actions = rule.actions.len(), "created rule");
            Ok(rule)
        }
        .instrument(span)
        .await
    }

    pub async fn update_rule(
        &self,
        caller: Option<&Caller>,
        body: &RuleDefinitionUpdate,
    ) -> Result<Rule, RuleError> {
        let caller = authenticate(caller)?;
        let span = info_span!("updateRule", user_id = %caller.user_id, rule_id = %body.id);

        async {
            require_id(&body.id)?;
            self.validate_name(body.name.as_deref(), false)?;
            validate_definition(body.conditions.as_ref(), &body.actions)?;

            let current = self
                .store
                .get_rule(&caller.user_id, &body.id)
                .await
                .map_err(|err| write_error(err, UPDATE_FAILED))?;

            let conditions = flatten_optional(body.conditions.as_ref());
            let diff = diff_actions(&current.actions, &body.actions);
            let (deleted, updated, created) = (
                diff.to_delete.len(),
                diff.to_update.len(),
                diff.to_create.len(),
            );
            let plan = plan_update(&caller.user_id, body, conditions, diff);
            self.store
                .apply_plan(&plan)
                .await
                .map_err(|err| write_error(err, UPDATE_FAILED))?;

            let rule = self
                .store
                .get_rule(&caller.user_id, &body.id)
                .await
                .map_err(|err| persistence_error(err, UPDATE_FAILED))?;
            info!(deleted, updated, created, "updated rule");
            Ok(rule)
        }
        .instrument(span)
        .await
    }

    pub async fn update_rule_instructions(
        &self,
        caller: Option<&Caller>,
        body: &RuleInstructionsUpdate,
    ) -> Result<(), RuleError> {
        let caller = authenticate(caller)?;
        let span = info_span!("updateRuleInstructions", user_id = %caller.user_id, rule_id = %body.id);

        async {
            require_id(&body.id)?;
            self.store
                .update_instructions(&caller.user_id, &body.id, &body.instructions)
                .await
                .map_err(|err| write_error(err, UPDATE_FAILED))
        }
        .instrument(span)
        .await
    }

    pub async fn get_rule(&self, caller: Option<&Caller>, id: &str) -> Result<Rule, RuleError> {
        let caller = authenticate(caller)?;
        self.store
            .get_rule(&caller.user_id, id)
            .instrument(info_span!("getRule", user_id = %caller.user_id, rule_id = %id))
            .await
            .map_err(|err| write_error(err, "Error loading rule."))
    }

    pub async fn list_rules(&self, caller: Option<&Caller>) -> Result<Vec<Rule>, RuleError> {
        let caller = authenticate(caller)?;
        self.store
            .list_rules(&caller.user_id)
            .instrument(info_span!("listRules", user_id = %caller.user_id))
            .await
            .map_err(|err| persistence_error(err, "Error loading rules."))
    }

    pub async fn delete_rule(&self, caller: Option<&Caller>, id: &str) -> Result<(), RuleError> {
        let caller = authenticate(caller)?;
        let span = info_span!("deleteRule", user_id = %caller.user_id, rule_id = %id);

        async {
            require_id(id)?;
            self.store
                .delete_rule(&caller.user_id, id)
                .await
                .map_err(|err| write_error(err, "Error deleting rule."))?;
            info!("deleted rule");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn validate_name(&self, name: Option<&str>, required: bool) -> Result<(), RuleError> {
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ if required => {
                return Err(RuleError::ValidationFailed("Rule name is required".into()));
            }
            _ => return Ok(()),
        };

        if name.trim().is_empty() {
            return Err(RuleError::ValidationFailed(
                "Rule name cannot be blank".into(),
            ));
        }
        if name.chars().count() > self.max_name_length {
            return Err(RuleError::ValidationFailed(format!(
                "Rule name must be at most {} characters",
                self.max_name_length
            )));
        }
        Ok(())
    }
}

fn authenticate(caller: Option<&Caller>) -> Result<&Caller, RuleError> {
    caller
        .filter(|caller| !caller.user_id.is_empty())
        .ok_or(RuleError::NotAuthenticated)
}

fn require_id(id: &str) -> Result<(), RuleError> {
    if id.trim().is_empty() {
        return Err(RuleError::ValidationFailed("Rule id is required".into()));
    }
    Ok(())
}

fn validate_definition(
    conditions: Option<&Condition>,
    actions: &[ActionSpec],
) -> Result<(), RuleError> {
    if let Some(condition) = conditions {
        validate_condition(condition).map_err(|err| RuleError::ValidationFailed(err.to_string()))?;
    }
    actions.iter().try_for_each(validate_action)
}

fn validate_action(action: &ActionSpec) -> Result<(), RuleError> {
    let (field, value) = match action.action_type {
        ActionType::Label => ("label", &action.label),
        ActionType::Forward => ("to", &action.to),
        ActionType::CallWebhook => ("url", &action.url),
        _ => return Ok(()),
    };

    // An absent holder on a stored action keeps the stored column.
    if value.is_none() && action.id.is_some() {
        return Ok(());
    }

    match ActionSpec::value_of(value) {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(RuleError::ValidationFailed(format!(
            "{} action requires a {field}",
            action.action_type.as_str()
        ))),
    }
}

/// Map a failed read or write, keeping the kinds a caller can act on.
fn write_error(err: RuleStoreError, fallback: &str) -> RuleError {
    match err {
        RuleStoreError::NotFound(id) => RuleError::NotFound(id),
        RuleStoreError::UniqueViolation(UniqueField::Name) => RuleError::DuplicateName,
        RuleStoreError::UniqueViolation(UniqueField::GroupId) => RuleError::DuplicateGroupBinding,
        other => persistence_error(other, fallback),
    }
}

fn persistence_error(err: RuleStoreError, message: &str) -> RuleError {
    error!(error = %err, "{message}");
    RuleError::PersistenceFailed(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use crate::rules::conditions::{CategoryFilterType, LeafCondition};
    use crate::rules::repositories::RuleRepository;
    use crate::rules::types::FieldValue;
    use crate::Database;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup_service() -> (RuleService<RuleRepository>, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (RuleService::new(RuleRepository::new(db)), dir)
    }

    fn new_rule(name: &str) -> NewRuleDefinition {
        NewRuleDefinition {
            name: name.into(),
            automate: None,
            run_on_threads: None,
            conditions: None,
            actions: vec![ActionSpec::new(ActionType::Archive)],
        }
    }

    fn grouped(name: &str, group_id: &str) -> NewRuleDefinition {
        NewRuleDefinition {
            conditions: Some(Condition::all(vec![
                LeafCondition::Group {
                    group_id: group_id.into(),
                }
                .into(),
            ])),
            ..new_rule(name)
        }
    }

    fn alice() -> Caller {
        Caller::new("alice")
    }

    #[tokio::test]
    async fn anonymous_callers_are_rejected() {
        let (service, _dir) = setup_service().await;
        assert_eq!(
            service.create_rule(None, &new_rule("x")).await,
            Err(RuleError::NotAuthenticated)
        );
        assert_eq!(
            service.list_rules(Some(&Caller::new(""))).await,
            Err(RuleError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn create_validates_name_and_required_action_fields() {
        let (service, _dir) = setup_service().await;
        let caller = alice();

        let err = service
            .create_rule(Some(&caller), &new_rule("   "))
            .await
            .expect_err("blank name");
        assert!(matches!(err, RuleError::ValidationFailed(_)));

        let err = service
            .create_rule(Some(&caller), &new_rule(&"x".repeat(201)))
            .await
            .expect_err("long name");
        assert!(matches!(err, RuleError::ValidationFailed(_)));

        let mut missing_label = new_rule("Labels");
        missing_label.actions = vec![ActionSpec::new(ActionType::Label)];
        let err = service
            .create_rule(Some(&caller), &missing_label)
            .await
            .expect_err("label action without label");
        assert_eq!(
            err,
            RuleError::ValidationFailed("LABEL action requires a label".into())
        );

        let mut empty_group = new_rule("Empty");
        empty_group.conditions = Some(Condition::any(vec![]));
        let err = service
            .create_rule(Some(&caller), &empty_group)
            .await
            .expect_err("empty OR");
        assert!(matches!(err, RuleError::ValidationFailed(_)));

        assert!(service.list_rules(Some(&caller)).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_only_conflicts_for_the_same_user() {
        let (service, _dir) = setup_service().await;
        service
            .create_rule(Some(&alice()), &new_rule("Receipts"))
            .await
            .expect("first");

        assert_eq!(
            service
                .create_rule(Some(&alice()), &new_rule("Receipts"))
                .await,
            Err(RuleError::DuplicateName)
        );
        assert_eq!(
            RuleError::DuplicateName.to_string(),
            "Rule name already exists"
        );

        service
            .create_rule(Some(&Caller::new("bob")), &new_rule("Receipts"))
            .await
            .expect("other user may reuse the name");
    }

    #[tokio::test]
    async fn group_binding_is_exclusive_but_rebinding_the_owner_succeeds() {
        let (service, _dir) = setup_service().await;
        let caller = alice();
        let owner = service
            .create_rule(Some(&caller), &grouped("Owner", "group-1"))
            .await
            .expect("owner");

        let err = service
            .create_rule(Some(&caller), &grouped("Intruder", "group-1"))
            .await
            .expect_err("second binding");
        assert_eq!(err, RuleError::DuplicateGroupBinding);
        assert_eq!(
            err.to_string(),
            "Group already has a rule. Please use the existing rule."
        );

        let update = RuleDefinitionUpdate {
            id: owner.id.clone(),
            name: None,
            automate: None,
            run_on_threads: None,
            conditions: grouped("Owner", "group-1").conditions,
            actions: owner
                .actions
                .iter()
                .map(|a| ActionSpec::new(a.action_type).with_id(a.id.clone()))
                .collect(),
        };
        let rule = service
            .update_rule(Some(&caller), &update)
            .await
            .expect("rebind own group");
        assert_eq!(rule.group_id.as_deref(), Some("group-1"));
        let ids: Vec<&str> = rule.actions.iter().map(|a| a.id.as_str()).collect();
        let owner_ids: Vec<&str> = owner.actions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, owner_ids);
    }

    #[tokio::test]
    async fn update_replaces_conditions_and_reconciles_actions() {
        let (service, _dir) = setup_service().await;
        let caller = alice();
        let mut body = new_rule("Mixed");
        body.conditions = Some(Condition::all(vec![
            LeafCondition::From {
                value: "old@example.com".into(),
            }
            .into(),
            LeafCondition::Categories {
                filter_type: Some(CategoryFilterType::Include),
                category_ids: vec!["cat-1".into()],
            }
            .into(),
        ]));
        body.actions.push(ActionSpec::new(ActionType::Label).with_label("x"));
        let rule = service.create_rule(Some(&caller), &body).await.expect("create");
        let label_id = rule.actions[1].id.clone();

        let update = RuleDefinitionUpdate {
            id: rule.id.clone(),
            name: Some("Renamed".into()),
            automate: Some(true),
            run_on_threads: None,
            conditions: Some(Condition::all(vec![
                LeafCondition::Subject {
                    value: "Invoice".into(),
                }
                .into(),
            ])),
            actions: vec![
                ActionSpec::new(ActionType::Label)
                    .with_id(label_id.clone())
                    .with_label("y"),
                ActionSpec::new(ActionType::CallWebhook).with_url("https://hooks.example.com"),
            ],
        };
        let updated = service
            .update_rule(Some(&caller), &update)
            .await
            .expect("update");

        assert_eq!(updated.name, "Renamed");
        assert!(updated.automate);
        assert_eq!(updated.from, None);
        assert_eq!(updated.subject.as_deref(), Some("Invoice"));
        assert_eq!(updated.category_filter_type, None);
        assert!(updated.category_filters.is_empty());
        assert_eq!(updated.actions.len(), 2);
        assert!(updated.actions.iter().all(|a| a.action_type != ActionType::Archive));
        let label = updated
            .actions
            .iter()
            .find(|a| a.id == label_id)
            .expect("label kept");
        assert_eq!(label.label.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn stored_actions_may_omit_required_fields_on_update() {
        let (service, _dir) = setup_service().await;
        let caller = alice();
        let mut body = new_rule("Forwarding");
        body.actions = vec![
            ActionSpec::new(ActionType::Label).with_label("News"),
            ActionSpec::new(ActionType::Forward).with_to("a@b.com"),
        ];
        let rule = service.create_rule(Some(&caller), &body).await.expect("create");

        let resubmit = RuleDefinitionUpdate {
            id: rule.id.clone(),
            name: None,
            automate: None,
            run_on_threads: None,
            conditions: None,
            actions: rule
                .actions
                .iter()
                .map(|a| ActionSpec::new(a.action_type).with_id(a.id.clone()))
                .collect(),
        };
        let updated = service
            .update_rule(Some(&caller), &resubmit)
            .await
            .expect("resubmit stored actions");
        assert_eq!(updated.actions[0].label.as_deref(), Some("News"));
        assert_eq!(updated.actions[1].to.as_deref(), Some("a@b.com"));

        let mut cleared = ActionSpec::new(ActionType::Label).with_id(rule.actions[0].id.clone());
        cleared.label = Some(FieldValue::null());
        let err = service
            .update_rule(
                Some(&caller),
                &RuleDefinitionUpdate {
                    actions: vec![cleared],
                    ..resubmit.clone()
                },
            )
            .await
            .expect_err("clearing a required field");
        assert_eq!(
            err,
            RuleError::ValidationFailed("LABEL action requires a label".into())
        );

        let err = service
            .update_rule(
                Some(&caller),
                &RuleDefinitionUpdate {
                    actions: vec![ActionSpec::new(ActionType::CallWebhook)],
                    ..resubmit
                },
            )
            .await
            .expect_err("new action without its field");
        assert!(matches!(err, RuleError::ValidationFailed(_)));

        let stored = service.get_rule(Some(&caller), &rule.id).await.expect("get");
        assert_eq!(stored.actions.len(), 2);
    }

    #[tokio::test]
    async fn renaming_onto_another_rules_name_is_a_duplicate() {
        let (service, _dir) = setup_service().await;
        let caller = alice();
        let first = service
            .create_rule(Some(&caller), &new_rule("Receipts"))
            .await
            .expect("first");
        let second = service
            .create_rule(Some(&caller), &new_rule("Invoices"))
            .await
            .expect("second");

        let rename = RuleDefinitionUpdate {
            id: second.id.clone(),
            name: Some("Receipts".into()),
            automate: Some(true),
            run_on_threads: None,
            conditions: None,
            actions: vec![],
        };
        assert_eq!(
            service.update_rule(Some(&caller), &rename).await,
            Err(RuleError::DuplicateName)
        );

        let first_after = service.get_rule(Some(&caller), &first.id).await.expect("first");
        let second_after = service
            .get_rule(Some(&caller), &second.id)
            .await
            .expect("second");
        assert_eq!(first_after, first);
        assert_eq!(second_after, second);
    }

    #[tokio::test]
    async fn update_of_missing_or_foreign_rule_is_not_found() {
        let (service, _dir) = setup_service().await;
        let rule = service
            .create_rule(Some(&alice()), &new_rule("Private"))
            .await
            .expect("create");

        let update = RuleDefinitionUpdate {
            id: rule.id.clone(),
            name: None,
            automate: None,
            run_on_threads: None,
            conditions: None,
            actions: vec![],
        };
        let err = service
            .update_rule(Some(&Caller::new("bob")), &update)
            .await
            .expect_err("foreign rule");
        assert!(matches!(err, RuleError::NotFound(_)));

        let blank = RuleDefinitionUpdate {
            id: String::new(),
            ..update
        };
        let err = service
            .update_rule(Some(&alice()), &blank)
            .await
            .expect_err("missing id");
        assert!(matches!(err, RuleError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn unknown_action_id_fails_without_partial_writes() {
        let (service, _dir) = setup_service().await;
        let caller = alice();
        let rule = service
            .create_rule(Some(&caller), &new_rule("Atomic"))
            .await
            .expect("create");

        let mut ghost = ActionSpec::new(ActionType::Reply).with_id("ghost");
        ghost.content = Some(FieldValue::new("hi"));
        let update = RuleDefinitionUpdate {
            id: rule.id.clone(),
            name: Some("Changed".into()),
            automate: None,
            run_on_threads: None,
            conditions: None,
            actions: vec![ghost],
        };
        assert_eq!(
            service.update_rule(Some(&caller), &update).await,
            Err(RuleError::PersistenceFailed("Error updating rule.".into()))
        );

        let stored = service.get_rule(Some(&caller), &rule.id).await.expect("get");
        assert_eq!(stored.name, "Atomic");
        assert_eq!(stored.actions, rule.actions);
    }

    #[tokio::test]
    async fn instructions_update_and_delete() {
        let (service, _dir) = setup_service().await;
        let caller = alice();
        let rule = service
            .create_rule(Some(&caller), &new_rule("Prompted"))
            .await
            .expect("create");

        service
            .update_rule_instructions(
                Some(&caller),
                &RuleInstructionsUpdate {
                    id: rule.id.clone(),
                    instructions: "Anything from my landlord".into(),
                },
            )
            .await
            .expect("instructions");
        let stored = service.get_rule(Some(&caller), &rule.id).await.expect("get");
        assert_eq!(
            stored.instructions.as_deref(),
            Some("Anything from my landlord")
        );

        service
            .delete_rule(Some(&caller), &rule.id)
            .await
            .expect("delete");
        assert!(matches!(
            service.get_rule(Some(&caller), &rule.id).await,
            Err(RuleError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_rule(Some(&caller), &rule.id).await,
            Err(RuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn configured_name_limit_applies() {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("limit.sqlite"))
            .await
            .expect("db");
        run_migrations(&db).await.expect("migrations");
        let service = RuleService::with_config(
            RuleRepository::new(db),
            &RulesConfig { max_name_length: 5 },
        );

        let err = service
            .create_rule(Some(&alice()), &new_rule("Too long"))
            .await
            .expect_err("over limit");
        assert!(matches!(err, RuleError::ValidationFailed(_)));
        service
            .create_rule(Some(&alice()), &new_rule("Short"))
            .await
            .expect("within limit");
    }
}
