use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::filters::{registry_for_changes, restore_missing_values};
use crate::logic::deploy::filter_undeployable_values;
use crate::logic::filter::{Filter, FilterOptions};
use crate::model::{Change, ElemId, Values};
use crate::store::ElementsSource;

/// Strips values the service does not accept for the change's action, and
/// puts them back once the change is deployed.
pub struct UndeployableValuesFilter {
    elements_source: Arc<dyn ElementsSource>,
    originals: Mutex<HashMap<ElemId, Values>>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(UndeployableValuesFilter {
        elements_source: options.elements_source.clone(),
        originals: Mutex::new(HashMap::new()),
    })
}

#[async_trait::async_trait]
impl Filter for UndeployableValuesFilter {
    fn name(&self) -> &'static str {
        "undeployableValues"
    }

    async fn pre_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        let registry = registry_for_changes(changes, self.elements_source.as_ref()).await?;
        if registry.is_empty() {
            return Ok(());
        }
        for change in changes.iter_mut() {
            let action = change.action();
            let Some(instance) = change.instance_mut() else {
                continue;
            };
            let filtered = filter_undeployable_values(instance, action, &registry)?;
            if filtered.value != instance.value {
                log::debug!("Removed undeployable values of {} for {}", instance.elem_id, action);
                self.originals
                    .lock()
                    .insert(instance.elem_id.clone(), std::mem::replace(&mut instance.value, filtered.value));
            }
        }
        Ok(())
    }

    async fn on_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        for change in changes.iter_mut() {
            let Some(instance) = change.instance_mut() else {
                continue;
            };
            if let Some(original) = self.originals.lock().remove(&instance.elem_id) {
                restore_missing_values(&mut instance.value, &original);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryPaginator, RecordingDeployClient};
    use crate::config::EngineConfig;
    use crate::filters::test_support::options_with;
    use crate::model::{annotations, values_from_json, Element, Field, InstanceElement, ObjectType, PrimitiveKind, TypeRef, Value};
    use crate::store::InMemoryElementsSource;
    use serde_json::json;

    #[tokio::test]
    async fn test_strip_and_restore() {
        let type_id = ElemId::type_id("okta", "Group");
        let mut group_type = ObjectType::new(type_id.clone());
        group_type.add_field(
            Field::new(&type_id, "type", TypeRef::Primitive(PrimitiveKind::String))
                .with_annotation(annotations::CREATABLE, false),
        );
        group_type.add_field(Field::new(&type_id, "name", TypeRef::Primitive(PrimitiveKind::String)));
        let filter = create(&options_with(
            EngineConfig::default(),
            Arc::new(InMemoryPaginator::new()),
            Arc::new(RecordingDeployClient::new()),
            InMemoryElementsSource::from_elements(vec![Element::Type(group_type)]),
        ));

        let group = InstanceElement::new("admins", &type_id, values_from_json(json!({"name": "Admins", "type": "OKTA_GROUP"})));
        let mut changes = vec![Change::addition(group.clone())];

        filter.pre_deploy(&mut changes).await.unwrap();
        assert!(!changes[0].instance().unwrap().value.contains_key("type"));

        changes[0].instance_mut().unwrap().value.insert("id".to_string(), Value::string("00g1"));
        filter.on_deploy(&mut changes).await.unwrap();
        let deployed = changes[0].instance().unwrap();
        assert_eq!(deployed.value["type"], Value::string("OKTA_GROUP"));
        assert_eq!(deployed.value["id"], Value::string("00g1"));
        println!("✓ Undeployable values restored after deploy");
    }
}
