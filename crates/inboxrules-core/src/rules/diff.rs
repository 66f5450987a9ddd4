use std::collections::HashSet;

use super::types::{Action, ActionSpec};

/// How a submitted action list reconciles against the stored one.
///
/// Every submitted action lands in exactly one of `to_update` (has an id) or
/// `to_create` (no id). Every stored action whose id was not submitted lands in
/// `to_delete`. Order follows the input lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionDiff {
    pub to_delete: Vec<String>,
    pub to_update: Vec<ActionSpec>,
    pub to_create: Vec<ActionSpec>,
}

/// Partition `previous` and `submitted` into deletes, updates and creates.
///
/// A submitted id that is not among `previous` is still treated as an update;
/// the store rejects it when the write plan is applied.
pub fn diff_actions(previous: &[Action], submitted: &[ActionSpec]) -> ActionDiff {
    let kept: HashSet<&str> = submitted
        .iter()
        .filter_map(|action| action.id.as_deref())
        .collect();

    let to_delete = previous
        .iter()
        .filter(|action| !kept.contains(action.id.as_str()))
        .map(|action| action.id.clone())
        .collect();

    let (to_update, to_create) = submitted
        .iter()
        .cloned()
        .partition(|action| action.id.is_some());

    ActionDiff {
        to_delete,
        to_update,
        to_create,
    }
}
