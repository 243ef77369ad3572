use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::logic::deploy::transform_removed_values_to_null;
use crate::logic::filter::{Filter, FilterOptions};
use crate::model::{Change, ElemId, Value, Values};

/// Sends removed values as explicit nulls for types whose API keeps fields
/// that are left out of an update.
pub struct NullRemovedValuesFilter {
    config: Arc<EngineConfig>,
    originals: Mutex<HashMap<ElemId, Values>>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(NullRemovedValuesFilter {
        config: options.config.clone(),
        originals: Mutex::new(HashMap::new()),
    })
}

/// Drop nulls that are not in `original`, keeping everything else.
fn remove_added_nulls(current: &mut Values, original: &Values) {
    current.retain(|key, value| !(value.is_null() && !original.contains_key(key)));
    for (key, value) in current.iter_mut() {
        if let (Value::Object(current_map), Some(Value::Object(original_map))) = (value, original.get(key)) {
            remove_added_nulls(current_map, original_map);
        }
    }
}

#[async_trait::async_trait]
impl Filter for NullRemovedValuesFilter {
    fn name(&self) -> &'static str {
        "nullRemovedValues"
    }

    async fn pre_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        let types = &self.config.deploy.null_removed_values_types;
        for change in changes.iter_mut() {
            if !change.is_modification() || !types.iter().any(|t| t == change.type_name()) {
                continue;
            }
            let Some(instance) = change.instance() else {
                continue;
            };
            self.originals
                .lock()
                .insert(instance.elem_id.clone(), instance.value.clone());
            *change = transform_removed_values_to_null(change, &[], false)?;
        }
        Ok(())
    }

    async fn on_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        for change in changes.iter_mut().filter(|c| c.is_modification()) {
            let Some(instance) = change.instance_mut() else {
                continue;
            };
            if let Some(original) = self.originals.lock().remove(&instance.elem_id) {
                remove_added_nulls(&mut instance.value, &original);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::options;
    use crate::model::{values_from_json, InstanceElement};
    use serde_json::json;

    fn group(value: serde_json::Value) -> InstanceElement {
        InstanceElement::new("admins", &crate::model::ElemId::type_id("okta", "Group"), values_from_json(value))
    }

    #[tokio::test]
    async fn test_nulls_sent_and_removed_after_deploy() {
        let mut config = EngineConfig::default();
        config.deploy.null_removed_values_types = vec!["Group".to_string()];
        let filter = create(&options(config));

        let before = group(json!({"name": "Admins", "description": "old", "profile": {"a": 1, "b": 2}}));
        let after = group(json!({"name": "Admins", "profile": {"a": 1}}));
        let mut changes = vec![
            Change::modification(before, after.clone()),
            Change::addition(group(json!({"name": "New"}))),
        ];

        filter.pre_deploy(&mut changes).await.unwrap();
        let sent = changes[0].instance().unwrap();
        assert_eq!(sent.value["description"], Value::Null);
        assert_eq!(sent.value["profile"], Value::from(json!({"a": 1, "b": null})));
        assert_eq!(changes[1].instance().unwrap().value.len(), 1);

        // The service assigned a value while deploying; it is kept.
        changes[0]
            .instance_mut()
            .unwrap()
            .value
            .insert("lastUpdated".to_string(), Value::string("2024-01-01"));
        filter.on_deploy(&mut changes).await.unwrap();

        let mut expected = after;
        expected
            .value
            .insert("lastUpdated".to_string(), Value::string("2024-01-01"));
        assert_eq!(changes[0].instance().unwrap(), &expected);
        println!("✓ Removed values are nulled for deploy only");
    }

    #[test]
    fn test_remove_added_nulls_keeps_original_nulls() {
        let original = values_from_json(json!({"a": null, "nested": {}}));
        let mut current = values_from_json(json!({"a": null, "b": null, "nested": {"c": null}}));
        remove_added_nulls(&mut current, &original);
        assert_eq!(Value::Object(current), Value::from(json!({"a": null, "nested": {}})));
    }
}
