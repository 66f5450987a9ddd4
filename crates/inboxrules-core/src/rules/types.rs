use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::conditions::{CategoryFilterType, Condition, FlatConditions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ActionType {
    Archive,
    Label,
    Reply,
    SendEmail,
    Forward,
    DraftEmail,
    MarkSpam,
    CallWebhook,
    MarkRead,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Archive => "ARCHIVE",
            ActionType::Label => "LABEL",
            ActionType::Reply => "REPLY",
            ActionType::SendEmail => "SEND_EMAIL",
            ActionType::Forward => "FORWARD",
            ActionType::DraftEmail => "DRAFT_EMAIL",
            ActionType::MarkSpam => "MARK_SPAM",
            ActionType::CallWebhook => "CALL_WEBHOOK",
            ActionType::MarkRead => "MARK_READ",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ARCHIVE" => Some(Self::Archive),
            "LABEL" => Some(Self::Label),
            "REPLY" => Some(Self::Reply),
            "SEND_EMAIL" => Some(Self::SendEmail),
            "FORWARD" => Some(Self::Forward),
            "DRAFT_EMAIL" => Some(Self::DraftEmail),
            "MARK_SPAM" => Some(Self::MarkSpam),
            "CALL_WEBHOOK" => Some(Self::CallWebhook),
            "MARK_READ" => Some(Self::MarkRead),
            _ => None,
        }
    }
}

/// A stored rule with its flattened conditions and attached actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Rule {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub automate: bool,
    pub run_on_threads: bool,
    pub instructions: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub group_id: Option<String>,
    pub category_filter_type: Option<CategoryFilterType>,
    pub category_filters: Vec<String>,
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn flat_conditions(&self) -> FlatConditions {
        FlatConditions {
            instructions: self.instructions.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            subject: self.subject.clone(),
            group_id: self.group_id.clone(),
            category_filter_type: self.category_filter_type,
            category_filters: self.category_filters.clone(),
        }
    }

    /// The stored conditions as a tree an update body can send back unchanged.
    pub fn conditions(&self) -> Option<Condition> {
        self.flat_conditions().to_condition()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Action {
    pub id: String,
    pub rule_id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub label: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Holder for one optional action field.
///
/// The holder being absent, present with `null`, and present with a string
/// are three different things: on update an absent holder leaves the stored
/// column alone while `{"value": null}` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FieldValue {
    #[serde(default)]
    pub value: Option<String>,
}

impl FieldValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    pub fn null() -> Self {
        Self { value: None }
    }
}

/// An action as submitted by the client. `id` is present only for actions
/// that already exist in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ActionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<FieldValue>,
}

impl ActionSpec {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            id: None,
            action_type,
            label: None,
            subject: None,
            content: None,
            to: None,
            cc: None,
            bcc: None,
            url: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(FieldValue::new(label));
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(FieldValue::new(to));
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(FieldValue::new(url));
        self
    }

    /// The non-null value of a field, if any.
    pub fn value_of(field: &Option<FieldValue>) -> Option<&str> {
        field.as_ref().and_then(|holder| holder.value.as_deref())
    }
}

/// Body of a create request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewRuleDefinition {
    pub name: String,
    #[serde(default)]
    pub automate: Option<bool>,
    #[serde(default)]
    pub run_on_threads: Option<bool>,
    #[serde(default)]
    pub conditions: Option<Condition>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Body of an update request. `name`, `automate` and `run_on_threads` keep
/// their stored values when omitted. `conditions` and `actions` replace the
/// stored ones and must be present; `"conditions": null` clears them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RuleDefinitionUpdate {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub automate: Option<bool>,
    #[serde(default)]
    pub run_on_threads: Option<bool>,
    #[serde(deserialize_with = "Option::deserialize")]
    pub conditions: Option<Condition>,
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RuleInstructionsUpdate {
    pub id: String,
    pub instructions: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_round_trips_through_storage_names() {
        for action_type in [
            ActionType::Archive,
            ActionType::Label,
            ActionType::Reply,
            ActionType::SendEmail,
            ActionType::Forward,
            ActionType::DraftEmail,
            ActionType::MarkSpam,
            ActionType::CallWebhook,
            ActionType::MarkRead,
        ] {
            assert_eq!(ActionType::from_str(action_type.as_str()), Some(action_type));
            assert_eq!(
                serde_json::to_value(action_type).expect("serialize"),
                json!(action_type.as_str())
            );
        }
        assert_eq!(ActionType::from_str("archive"), None);
    }

    #[test]
    fn field_holders_keep_absent_null_and_empty_apart() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "type": "REPLY",
            "subject": {"value": ""},
            "content": {"value": null},
            "cc": {}
        }))
        .expect("parse");

        assert_eq!(spec.id, None);
        assert_eq!(spec.label, None);
        assert_eq!(spec.subject, Some(FieldValue::new("")));
        assert_eq!(spec.content, Some(FieldValue::null()));
        assert_eq!(spec.cc, Some(FieldValue::null()));
        assert_eq!(ActionSpec::value_of(&spec.subject), Some(""));
        assert_eq!(ActionSpec::value_of(&spec.content), None);
    }

    #[test]
    fn update_body_defaults_optional_parts() {
        let body: RuleDefinitionUpdate = serde_json::from_value(json!({
            "id": "rule-1",
            "conditions": null,
            "actions": []
        }))
        .expect("parse");
        assert_eq!(body.name, None);
        assert_eq!(body.automate, None);
        assert_eq!(body.conditions, None);
        assert!(body.actions.is_empty());
    }

    #[test]
    fn update_body_requires_conditions_and_actions() {
        let rename_only =
            serde_json::from_value::<RuleDefinitionUpdate>(json!({"id": "rule-1", "name": "Renamed"}));
        assert!(rename_only.is_err());

        let missing_actions = serde_json::from_value::<RuleDefinitionUpdate>(json!({
            "id": "rule-1",
            "conditions": null
        }));
        assert!(missing_actions.is_err());

        let missing_conditions = serde_json::from_value::<RuleDefinitionUpdate>(json!({
            "id": "rule-1",
            "actions": []
        }));
        assert!(missing_conditions.is_err());
    }
}
