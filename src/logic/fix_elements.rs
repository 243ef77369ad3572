use std::collections::BTreeMap;

use crate::model::{Change, ChangeError, Value};

/// Remove repeated entries from configured list fields of added or modified
/// instances. Returns a warning per field that had duplicates.
pub fn remove_duplicate_list_entries(
    changes: &mut [Change],
    fields_by_type: &BTreeMap<String, Vec<String>>,
) -> Vec<ChangeError> {
    let mut warnings = Vec::new();
    for change in changes.iter_mut().filter(|c| !c.is_removal()) {
        let Some(fields) = fields_by_type.get(change.type_name()) else {
            continue;
        };
        let Some(instance) = change.instance_mut() else {
            continue;
        };
        for field in fields {
            let Some(Value::Array(items)) = instance.value.get_mut(field) else {
                continue;
            };
            let mut unique: Vec<Value> = Vec::with_capacity(items.len());
            let mut duplicates = Vec::new();
            for item in items.drain(..) {
                if unique.contains(&item) {
                    duplicates.push(item.to_primitive_string().unwrap_or_else(|| item.to_json().to_string()));
                } else {
                    unique.push(item);
                }
            }
            *items = unique;
            if !duplicates.is_empty() {
                log::info!("Removed {} duplicate entries from {}.{}", duplicates.len(), instance.elem_id, field);
                warnings.push(ChangeError::warning(
                    &instance.elem_id,
                    "Duplicate list entries were removed",
                    format!(
                        "The following entries of {} appeared more than once and will be deployed once: {}",
                        field,
                        duplicates.join(", ")
                    ),
                ));
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{values_from_json, ElemId, InstanceElement, Severity};
    use serde_json::json;

    #[test]
    fn test_remove_duplicate_list_entries() {
        let type_id = ElemId::type_id("okta", "Group");
        let group = InstanceElement::new(
            "admins",
            &type_id,
            values_from_json(json!({"users": ["a", "b", "a", "c", "b"], "tags": ["x", "x"]})),
        );
        let mut changes = vec![
            Change::addition(group.clone()),
            Change::removal(group),
        ];
        let fields = BTreeMap::from([("Group".to_string(), vec!["users".to_string()])]);

        let warnings = remove_duplicate_list_entries(&mut changes, &fields);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);
        assert!(warnings[0].detailed_message.ends_with("a, b"));

        let fixed = changes[0].instance().unwrap();
        assert_eq!(fixed.value["users"], Value::from(json!(["a", "b", "c"])));
        assert_eq!(fixed.value["tags"], Value::from(json!(["x", "x"])));
        let removed = changes[1].instance().unwrap();
        assert_eq!(removed.value["users"].as_array().unwrap().len(), 5);
    }
}
