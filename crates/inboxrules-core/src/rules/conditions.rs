use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum LogicalOperator {
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum CategoryFilterType {
    Include,
    Exclude,
}

impl CategoryFilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryFilterType::Include => "include",
            CategoryFilterType::Exclude => "exclude",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "include" => Some(Self::Include),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LogicalCondition {
    pub op: LogicalOperator,
    pub children: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum LeafCondition {
    Instructions {
        value: String,
    },
    From {
        value: String,
    },
    To {
        value: String,
    },
    Subject {
        value: String,
    },
    Group {
        group_id: String,
    },
    Categories {
        filter_type: Option<CategoryFilterType>,
        #[serde(default)]
        category_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(untagged)]
#[ts(export)]
pub enum Condition {
    Logical(LogicalCondition),
    Leaf(LeafCondition),
}

impl Condition {
    pub fn all(children: Vec<Condition>) -> Self {
        Condition::Logical(LogicalCondition {
            op: LogicalOperator::And,
            children,
        })
    }

    pub fn any(children: Vec<Condition>) -> Self {
        Condition::Logical(LogicalCondition {
            op: LogicalOperator::Or,
            children,
        })
    }
}

impl From<LeafCondition> for Condition {
    fn from(leaf: LeafCondition) -> Self {
        Condition::Leaf(leaf)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("{0} condition requires at least one child")]
    EmptyGroup(&'static str),
}

/// Reject logical nodes without children, at any depth.
pub fn validate_condition(condition: &Condition) -> Result<(), ConditionError> {
    match condition {
        Condition::Leaf(_) => Ok(()),
        Condition::Logical(logical) => {
            if logical.children.is_empty() {
                let op = match logical.op {
                    LogicalOperator::And => "AND",
                    LogicalOperator::Or => "OR",
                };
                return Err(ConditionError::EmptyGroup(op));
            }
            logical.children.iter().try_for_each(validate_condition)
        }
    }
}

/// The fixed set of condition columns a rule row can hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatConditions {
    pub instructions: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub group_id: Option<String>,
    pub category_filter_type: Option<CategoryFilterType>,
    /// Empty whenever `category_filter_type` is `None`.
    pub category_filters: Vec<String>,
}

impl FlatConditions {
    /// Rebuild a one-level AND tree holding exactly the set fields, or `None`
    /// when no field is set.
    pub fn to_condition(&self) -> Option<Condition> {
        let mut leaves: Vec<Condition> = Vec::new();
        let scalars = [
            (&self.instructions, LeafKind::Instructions),
            (&self.from, LeafKind::From),
            (&self.to, LeafKind::To),
            (&self.subject, LeafKind::Subject),
            (&self.group_id, LeafKind::Group),
        ];
        for (value, kind) in scalars {
            if let Some(value) = value {
                leaves.push(kind.leaf(value.clone()).into());
            }
        }
        if let Some(filter_type) = self.category_filter_type {
            leaves.push(
                LeafCondition::Categories {
                    filter_type: Some(filter_type),
                    category_ids: self.category_filters.clone(),
                }
                .into(),
            );
        }
        if leaves.is_empty() {
            return None;
        }
        Some(Condition::all(leaves))
    }
}

#[derive(Clone, Copy)]
enum LeafKind {
    Instructions,
    From,
    To,
    Subject,
    Group,
}

impl LeafKind {
    fn leaf(self, value: String) -> LeafCondition {
        match self {
            LeafKind::Instructions => LeafCondition::Instructions { value },
            LeafKind::From => LeafCondition::From { value },
            LeafKind::To => LeafCondition::To { value },
            LeafKind::Subject => LeafCondition::Subject { value },
            LeafKind::Group => LeafCondition::Group { group_id: value },
        }
    }
}

/// Project a condition tree onto the rule row's condition columns.
///
/// Nesting and the AND/OR operators are not kept. Leaves are visited depth
/// first and the first non-empty value for each column wins. A category leaf
/// only counts when it carries a filter type, and its ids travel with it.
pub fn flatten_conditions(condition: &Condition) -> FlatConditions {
    let mut flat = FlatConditions::default();
    collect(condition, &mut flat);
    flat
}

/// Flatten an optional tree; no tree means every column is unset.
pub fn flatten_optional(condition: Option<&Condition>) -> FlatConditions {
    condition.map(flatten_conditions).unwrap_or_default()
}

fn collect(condition: &Condition, flat: &mut FlatConditions) {
    match condition {
        Condition::Logical(logical) => {
            for child in &logical.children {
                collect(child, flat);
            }
        }
        Condition::Leaf(leaf) => apply_leaf(leaf, flat),
    }
}

fn apply_leaf(leaf: &LeafCondition, flat: &mut FlatConditions) {
    match leaf {
        LeafCondition::Instructions { value } => fill(&mut flat.instructions, value),
        LeafCondition::From { value } => fill(&mut flat.from, value),
        LeafCondition::To { value } => fill(&mut flat.to, value),
        LeafCondition::Subject { value } => fill(&mut flat.subject, value),
        LeafCondition::Group { group_id } => fill(&mut flat.group_id, group_id),
        LeafCondition::Categories {
            filter_type: Some(filter_type),
            category_ids,
        } if flat.category_filter_type.is_none() => {
            flat.category_filter_type = Some(*filter_type);
            flat.category_filters = dedup_ids(category_ids);
        }
        LeafCondition::Categories { .. } => {}
    }
}

fn fill(slot: &mut Option<String>, value: &str) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value.to_string());
    }
}

fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !id.is_empty() && !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    unique
}
