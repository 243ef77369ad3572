//! Built-in filters. Each one handles a single concern of the fetch and
//! deploy flows; `default_filter_creators` lists them in chain order.

pub mod alias;
pub mod null_removed_values;
pub mod order;
pub mod remove_restrictions;
pub mod service_url;
pub mod standard_deploy;
pub mod undeployable_values;
pub mod user_ids;

use anyhow::Result;
use std::collections::BTreeSet;

use crate::logic::filter::FilterCreator;
use crate::model::{Change, ElemId, Element, InstanceElement, TypeRef, TypeRegistry, Value, Values};
use crate::store::ElementsSource;

/// The built-in filter chain. `on_fetch`, `pre_deploy` and `deploy` run in
/// this order, `on_deploy` in reverse.
pub fn default_filter_creators() -> Vec<FilterCreator> {
    vec![
        user_ids::create,
        remove_restrictions::create,
        order::create,
        alias::create,
        service_url::create,
        null_removed_values::create,
        undeployable_values::create,
        standard_deploy::create,
    ]
}

/// Every instance a change carries: `before` and `after` for modifications.
pub(crate) fn change_instances_mut(change: &mut Change) -> Vec<&mut InstanceElement> {
    match change {
        Change::Addition { after } => after.as_instance_mut().into_iter().collect(),
        Change::Removal { before } => before.as_instance_mut().into_iter().collect(),
        Change::Modification { before, after } => before
            .as_instance_mut()
            .into_iter()
            .chain(after.as_instance_mut())
            .collect(),
    }
}

/// Types of the changed instances, and the object types their fields use,
/// read from the elements source.
pub(crate) async fn registry_for_changes(changes: &[Change], source: &dyn ElementsSource) -> Result<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    let mut pending: Vec<ElemId> = changes
        .iter()
        .filter_map(Change::instance)
        .map(|i| i.type_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut seen: BTreeSet<ElemId> = pending.iter().cloned().collect();

    while let Some(type_id) = pending.pop() {
        let Some(Element::Type(object_type)) = source.get(&type_id).await? else {
            log::trace!("Type {} not found in elements source", type_id);
            continue;
        };
        for field in object_type.fields.values() {
            if let TypeRef::Object(nested) = field.field_type.inner() {
                if seen.insert(nested.clone()) {
                    pending.push(nested.clone());
                }
            }
        }
        registry.insert(object_type);
    }
    Ok(registry)
}

/// Put back values of `original` that are absent from `current`, descending
/// into objects present in both. Values set after the original was taken win.
pub(crate) fn restore_missing_values(current: &mut Values, original: &Values) {
    for (key, original_value) in original {
        match (current.get_mut(key), original_value) {
            (None, _) => {
                current.insert(key.clone(), original_value.clone());
            }
            (Some(Value::Object(current_map)), Value::Object(original_map)) => {
                restore_missing_values(current_map, original_map);
            }
            _ => {}
        }
    }
}
