use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::logic::references::get_parents;
use crate::model::{Change, ChangeId, DependencyAction, DependencyChange, ElemId, Value};

/// Adds or removes ordering edges between the changes of a batch.
///
/// An edge `source -> target` means `source` deploys only after `target`.
#[async_trait::async_trait]
pub trait DependencyChanger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn change_dependencies(
        &self,
        changes: &BTreeMap<ChangeId, Change>,
        dependencies: &BTreeMap<ChangeId, BTreeSet<ChangeId>>,
    ) -> Result<Vec<DependencyChange>>;
}

fn is_default_instance(change: &Change) -> bool {
    change
        .instance()
        .and_then(|i| i.value.get("system"))
        .and_then(Value::as_bool)
        == Some(true)
}

/// A modified default (system) instance deploys after every other change of
/// its type, so the instances it may point at exist before it is updated.
pub struct DefaultInstanceDependencyChanger {
    types: Vec<String>,
}

impl DefaultInstanceDependencyChanger {
    pub fn new(types: Vec<String>) -> Self {
        Self { types }
    }
}

#[async_trait::async_trait]
impl DependencyChanger for DefaultInstanceDependencyChanger {
    fn name(&self) -> &'static str {
        "defaultInstance"
    }

    async fn change_dependencies(
        &self,
        changes: &BTreeMap<ChangeId, Change>,
        _: &BTreeMap<ChangeId, BTreeSet<ChangeId>>,
    ) -> Result<Vec<DependencyChange>> {
        let mut result = Vec::new();
        for type_name in &self.types {
            let of_type: Vec<(ChangeId, &Change)> = changes
                .iter()
                .filter(|(_, c)| c.is_instance_change() && c.type_name() == type_name)
                .map(|(id, c)| (*id, c))
                .collect();
            let Some((default_id, _)) = of_type
                .iter()
                .find(|(_, c)| c.is_modification() && is_default_instance(c))
            else {
                continue;
            };
            result.extend(
                of_type
                    .iter()
                    .filter(|(id, _)| id != default_id)
                    .map(|(id, _)| DependencyChange::add(*default_id, *id)),
            );
        }
        Ok(result)
    }
}

/// Parents deploy before their added children; removed children go before
/// their removed parents.
pub struct ParentChildDependencyChanger;

#[async_trait::async_trait]
impl DependencyChanger for ParentChildDependencyChanger {
    fn name(&self) -> &'static str {
        "parentChild"
    }

    async fn change_dependencies(
        &self,
        changes: &BTreeMap<ChangeId, Change>,
        dependencies: &BTreeMap<ChangeId, BTreeSet<ChangeId>>,
    ) -> Result<Vec<DependencyChange>> {
        let by_id: HashMap<&ElemId, ChangeId> = changes.iter().map(|(id, c)| (c.elem_id(), *id)).collect();
        let mut result = Vec::new();
        for (child_id, change) in changes {
            let Some(instance) = change.instance() else {
                continue;
            };
            for parent in get_parents(instance) {
                let Some(parent_id) = by_id.get(&parent).copied() else {
                    continue;
                };
                let parent_change = &changes[&parent_id];
                let edge = match (change.is_removal(), parent_change.is_removal()) {
                    (false, false) if parent_change.is_addition() => DependencyChange::add(*child_id, parent_id),
                    (true, true) => DependencyChange::add(parent_id, *child_id),
                    _ => continue,
                };
                let exists = dependencies
                    .get(&edge.source)
                    .is_some_and(|targets| targets.contains(&edge.target));
                if !exists {
                    result.push(edge);
                }
            }
        }
        Ok(result)
    }
}

/// Apply dependency changes to an edge map.
pub fn apply_dependency_changes(
    dependencies: &mut BTreeMap<ChangeId, BTreeSet<ChangeId>>,
    dependency_changes: &[DependencyChange],
) {
    for change in dependency_changes {
        match change.action {
            DependencyAction::Add => {
                dependencies.entry(change.source).or_default().insert(change.target);
            }
            DependencyAction::Remove => {
                if let Some(targets) = dependencies.get_mut(&change.source) {
                    targets.remove(&change.target);
                }
            }
        }
    }
}
