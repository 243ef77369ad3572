use anyhow::Result;

use crate::logic::transform::{
    resolve_path, set_path, transform_values, walk_on_value, TransformOptions, WalkNextStep, WalkOrder,
};
use crate::model::{annotations, ActionName, Change, ElemId, Element, InstanceElement, TypeRegistry, Value};

fn action_annotation(action: ActionName) -> &'static str {
    match action {
        ActionName::Add => annotations::CREATABLE,
        ActionName::Modify => annotations::UPDATABLE,
        ActionName::Remove => annotations::DELETABLE,
    }
}

/// Drop every value whose field marks `action` as unsupported.
///
/// Only an annotation that is exactly `false` removes a value; fields without
/// the annotation keep their values, including nulls and empty containers.
pub fn filter_undeployable_values(
    instance: &InstanceElement,
    action: ActionName,
    registry: &TypeRegistry,
) -> Result<InstanceElement> {
    let annotation = action_annotation(action);
    let value = transform_values(
        instance.value.clone(),
        registry.get(&instance.type_id),
        registry,
        &instance.elem_id,
        TransformOptions::lenient(),
        |args| {
            let deployable = args
                .field
                .and_then(|field| field.annotations.get(annotation))
                .and_then(Value::as_bool)
                != Some(false);
            Ok(deployable.then_some(args.value))
        },
    )?;
    Ok(InstanceElement {
        value,
        ..instance.clone()
    })
}

/// Values never sent to the service.
pub enum IgnoredValues<'a> {
    /// Top level field names
    Names(&'a [String]),
    /// Any path the predicate matches
    Predicate(&'a dyn Fn(&ElemId) -> bool),
}

/// Remove ignored values from an instance. `config_fields` (top level names)
/// are always removed, whatever the ignore rule.
pub fn filter_ignored_values(
    instance: &InstanceElement,
    ignored: IgnoredValues<'_>,
    config_fields: &[String],
    registry: &TypeRegistry,
) -> Result<InstanceElement> {
    let mut filtered = instance.clone();
    let names: &[String] = match ignored {
        IgnoredValues::Names(names) => names,
        IgnoredValues::Predicate(predicate) => {
            filtered.value = transform_values(
                filtered.value,
                registry.get(&instance.type_id),
                registry,
                &instance.elem_id,
                TransformOptions::lenient(),
                |args| Ok((!predicate(args.path)).then_some(args.value)),
            )?;
            &[]
        }
    };
    for name in config_fields.iter().chain(names) {
        filtered.value.remove(name);
    }
    Ok(filtered)
}

/// For a modification, set explicit nulls in `after` for values that exist
/// in `before` but were removed, for APIs that keep omitted fields.
///
/// Removed objects have all their leaves nulled (only the object itself
/// with `skip_sub_fields`). Paths inside arrays are never nulled. Only the
/// subtree at `apply_to_path` is considered. Other changes are returned as is.
pub fn transform_removed_values_to_null(
    change: &Change,
    apply_to_path: &[String],
    skip_sub_fields: bool,
) -> Result<Change> {
    let (before, after) = match change {
        Change::Modification {
            before: Element::Instance(before),
            after: Element::Instance(after),
        } => (before, after),
        other => return Ok(other.clone()),
    };
    let root_id = before.elem_id.create_nested_id(apply_to_path);
    let before_element = Element::Instance(before.clone());
    let Some(before_root) = resolve_path(&before_element, &root_id) else {
        return Ok(change.clone());
    };

    let mut after_element = Element::Instance(after.clone());
    let mut removed = Vec::new();
    walk_on_value(&before_root, &root_id, WalkOrder::TopDown, &mut |value, path| {
        match resolve_path(&after_element, path) {
            None if !value.is_object() || skip_sub_fields => {
                removed.push(path.clone());
                WalkNextStep::Skip
            }
            None => WalkNextStep::Continue,
            Some(after_value) if after_value.is_object() => WalkNextStep::Continue,
            Some(_) => WalkNextStep::Skip,
        }
    });

    for path in removed {
        log::trace!("Setting removed value {} to null", path);
        set_path(&mut after_element, &path, Some(Value::Null))?;
    }
    Ok(Change::Modification {
        before: before_element,
        after: after_element,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{values_from_json, Field, ObjectType, PrimitiveKind, TypeRef};
    use serde_json::json;

    fn group_type() -> ObjectType {
        let type_id = ElemId::type_id("okta", "Group");
        let mut group = ObjectType::new(type_id.clone());
        group.add_field(
            Field::new(&type_id, "id", TypeRef::Primitive(PrimitiveKind::String))
                .with_annotation(annotations::CREATABLE, false)
                .with_annotation(annotations::UPDATABLE, false),
        );
        group.add_field(
            Field::new(&type_id, "name", TypeRef::Primitive(PrimitiveKind::String))
                .with_annotation(annotations::UPDATABLE, true),
        );
        group.add_field(Field::new(&type_id, "description", TypeRef::Primitive(PrimitiveKind::String)));
        group
    }

    fn group(value: serde_json::Value) -> InstanceElement {
        InstanceElement::new("admins", &ElemId::type_id("okta", "Group"), values_from_json(value))
    }

    #[test]
    fn test_filter_undeployable_values() {
        let registry = TypeRegistry::from_elements(&[Element::Type(group_type())]);
        let instance = group(json!({"id": "g1", "name": "Admins", "description": null, "profile": {}}));

        let filtered = filter_undeployable_values(&instance, ActionName::Modify, &registry).unwrap();
        assert!(!filtered.value.contains_key("id"));
        assert_eq!(filtered.value["name"], Value::string("Admins"));
        assert_eq!(filtered.value["description"], Value::Null);
        assert_eq!(filtered.value["profile"], Value::object());

        let filtered = filter_undeployable_values(&instance, ActionName::Remove, &registry).unwrap();
        assert!(filtered.value.contains_key("id"));
        println!("✓ Only fields explicitly marked non-deployable are dropped");
    }

    #[test]
    fn test_filter_ignored_values() {
        let registry = TypeRegistry::from_elements(&[Element::Type(group_type())]);
        let instance = group(json!({
            "id": "g1",
            "name": "Admins",
            "profile": {"secret": "x", "kept": "y"},
            "_links": {"self": "/groups/g1"},
        }));
        let config_fields = vec!["_links".to_string()];

        let filtered =
            filter_ignored_values(&instance, IgnoredValues::Names(&["id".to_string()]), &config_fields, &registry)
                .unwrap();
        assert_eq!(filtered.value.keys().collect::<Vec<_>>(), vec!["name", "profile"]);

        let predicate = |path: &ElemId| path.name() == "secret";
        let filtered =
            filter_ignored_values(&instance, IgnoredValues::Predicate(&predicate), &config_fields, &registry).unwrap();
        assert!(!filtered.value.contains_key("_links"));
        assert_eq!(filtered.value["profile"], Value::from(json!({"kept": "y"})));
        assert!(filtered.value.contains_key("id"));
    }

    #[test]
    fn test_transform_removed_values_to_null() {
        let before = group(json!({
            "name": "Admins",
            "description": "old",
            "tags": ["a", "b"],
            "members": ["u1", "u2"],
            "profile": {"title": "x", "nested": {"deep": 1}},
            "settings": {"theme": "dark", "keep": true},
        }));
        let after = group(json!({
            "name": "Admins",
            "members": ["u1"],
            "settings": {"keep": true},
        }));
        let change = Change::modification(before, after);

        let nulled = transform_removed_values_to_null(&change, &[], false).unwrap();
        let after = nulled.instance().unwrap();
        assert_eq!(after.value["description"], Value::Null);
        assert_eq!(after.value["tags"], Value::Null);
        assert_eq!(after.value["members"], Value::from(json!(["u1"])));
        assert_eq!(
            after.value["profile"],
            Value::from(json!({"title": null, "nested": {"deep": null}}))
        );
        assert_eq!(after.value["settings"], Value::from(json!({"theme": null, "keep": true})));

        let nulled = transform_removed_values_to_null(&change, &[], true).unwrap();
        assert_eq!(nulled.instance().unwrap().value["profile"], Value::Null);

        let nulled = transform_removed_values_to_null(&change, &["settings".to_string()], false).unwrap();
        let after = nulled.instance().unwrap();
        assert!(!after.value.contains_key("description"));
        assert_eq!(after.value["settings"], Value::from(json!({"theme": null, "keep": true})));
        println!("✓ Removed values become explicit nulls");
    }

    #[test]
    fn test_object_replaced_by_primitive_is_kept() {
        let before = group(json!({
            "name": "Admins",
            "profile": {"title": "x", "nested": {"deep": 1}},
            "settings": {"theme": {"name": "dark"}, "keep": true},
        }));
        let after = group(json!({
            "name": "Admins",
            "profile": "custom",
            "settings": {"theme": "dark", "keep": true},
        }));
        let change = Change::modification(before, after);

        for skip_sub_fields in [false, true] {
            let nulled = transform_removed_values_to_null(&change, &[], skip_sub_fields).unwrap();
            let after = nulled.instance().unwrap();
            assert_eq!(after.value["profile"], Value::string("custom"));
            assert_eq!(after.value["settings"], Value::from(json!({"theme": "dark", "keep": true})));
        }
    }

    #[test]
    fn test_transform_removed_values_ignores_additions() {
        let change = Change::addition(group(json!({"name": "Admins"})));
        assert_eq!(transform_removed_values_to_null(&change, &[], false).unwrap(), change);
    }
}
