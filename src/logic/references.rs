use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::FieldReferenceRule;
use crate::logic::filter::FetchWarning;
use crate::logic::naming::{get_value_at, get_value_at_mut};
use crate::logic::transform::resolve_path;
use crate::model::{ElemId, Element, InstanceElement, Reference, ResolvedValue, Value};
use crate::store::ElementsSource;

/// Resolve a reference against an elements source.
///
/// Never fails: a target that cannot be found (or a source error) yields a
/// missing reference carrying the target's name as raw value.
pub async fn resolve_reference(reference: &Reference, source: &dyn ElementsSource) -> Reference {
    let elem_id = match reference {
        Reference::Missing { .. } => return reference.clone(),
        other => other.elem_id().clone(),
    };
    let (top_level_id, path) = elem_id.create_top_level_parent_id();

    let target = match source.get(&top_level_id).await {
        Ok(target) => target,
        Err(e) => {
            log::warn!("Could not look up {}: {}", top_level_id, e);
            None
        }
    };
    let resolved = match target {
        Some(element) if path.is_empty() => Some(ResolvedValue::Element(Box::new(element))),
        Some(element) => resolve_path(&element, &elem_id).map(|v| ResolvedValue::Value(Box::new(v))),
        None => None,
    };

    match resolved {
        Some(value) => Reference::Resolved { elem_id, value },
        None => {
            log::debug!("Could not resolve reference to {}", elem_id);
            Reference::Missing {
                raw: elem_id.name().to_string(),
                elem_id,
            }
        }
    }
}

/// Ids of the `_parent` annotation entries of an instance.
pub fn get_parents(instance: &InstanceElement) -> Vec<ElemId> {
    instance.parents().into_iter().map(|r| r.elem_id().clone()).collect()
}

/// Service id -> element id, for instances of one type.
pub type ServiceIdIndex = HashMap<String, ElemId>;

/// Index instances of the given types by the value of their service id field.
pub fn index_by_service_id<'a>(
    elements: impl IntoIterator<Item = &'a Element>,
    service_id_field: impl Fn(&str) -> String,
) -> HashMap<String, ServiceIdIndex> {
    let mut index: HashMap<String, ServiceIdIndex> = HashMap::new();
    for instance in elements.into_iter().filter_map(Element::as_instance) {
        let field = service_id_field(instance.type_name());
        if let Some(service_id) = get_value_at(&instance.value, &field).and_then(Value::to_primitive_string) {
            index
                .entry(instance.type_name().to_string())
                .or_default()
                .insert(service_id, instance.elem_id.clone());
        }
    }
    index
}

/// Replaces service ids in configured fields with references.
pub struct ReferenceResolver<'a> {
    adapter: &'a str,
    index: HashMap<String, ServiceIdIndex>,
    fallback_index: HashMap<String, ServiceIdIndex>,
    missing_references: bool,
}

impl<'a> ReferenceResolver<'a> {
    /// `fallback_index` covers elements that were not re-fetched, used on partial fetch.
    pub fn new(
        adapter: &'a str,
        index: HashMap<String, ServiceIdIndex>,
        fallback_index: HashMap<String, ServiceIdIndex>,
        missing_references: bool,
    ) -> Self {
        Self {
            adapter,
            index,
            fallback_index,
            missing_references,
        }
    }

    fn lookup(&self, target_type: &str, service_id: &str) -> Option<&ElemId> {
        self.index
            .get(target_type)
            .and_then(|ids| ids.get(service_id))
            .or_else(|| self.fallback_index.get(target_type).and_then(|ids| ids.get(service_id)))
    }

    fn to_reference(&self, value: &Value, target_type: &str) -> Option<Value> {
        let service_id = value.to_primitive_string()?;
        match self.lookup(target_type, &service_id) {
            Some(elem_id) => Some(Value::reference(elem_id.clone())),
            None if self.missing_references => Some(Value::Reference(Reference::missing(
                self.adapter,
                target_type,
                service_id,
            ))),
            None => None,
        }
    }

    /// Apply the rules to one instance. Returns a warning per unmatched value.
    pub fn apply(&self, instance: &mut InstanceElement, rules: &[FieldReferenceRule]) -> Vec<FetchWarning> {
        let mut warnings = Vec::new();
        let elem_id = instance.elem_id.clone();
        for rule in rules {
            let Some(value) = get_value_at_mut(&mut instance.value, &rule.field) else {
                continue;
            };
            let targets: Vec<&mut Value> = match value {
                Value::Array(items) => items.iter_mut().collect(),
                single => vec![single],
            };
            for target in targets {
                if matches!(target, Value::Reference(_) | Value::Null) {
                    continue;
                }
                match self.to_reference(target, &rule.target_type) {
                    Some(reference) => {
                        if reference.as_reference().is_some_and(Reference::is_missing) {
                            warnings.push(FetchWarning::for_element(
                                &elem_id,
                                format!(
                                    "Could not find {} with id {:?} referenced from {}.{}",
                                    rule.target_type,
                                    target.to_primitive_string().unwrap_or_default(),
                                    elem_id,
                                    rule.field
                                ),
                            ));
                        }
                        *target = reference;
                    }
                    None => {
                        log::debug!("Leaving unmatched value of {}.{} as is", elem_id, rule.field);
                    }
                }
            }
        }
        warnings
    }
}

/// Add references to fetched instances according to per-type rules.
///
/// On partial fetch, targets that were not re-fetched are looked up in
/// `previous` (the elements of the last full fetch) and resolved against it.
/// If `previous` cannot be read, those targets become missing references.
pub async fn add_references(
    adapter: &str,
    elements: &mut [Element],
    rules_by_type: &BTreeMap<String, Vec<FieldReferenceRule>>,
    service_id_field: impl Fn(&str) -> String,
    previous: Option<&dyn ElementsSource>,
    missing_references: bool,
) -> Result<Vec<FetchWarning>> {
    if rules_by_type.values().all(|rules| rules.is_empty()) {
        return Ok(Vec::new());
    }
    let mut warnings = Vec::new();
    let index = index_by_service_id(elements.iter(), &service_id_field);
    let fallback_index = match previous {
        Some(source) => match source.get_all().await {
            Ok(previous_elements) => index_by_service_id(previous_elements.iter(), &service_id_field),
            Err(e) => {
                log::warn!("Could not read previously fetched elements: {}", e);
                warnings.push(FetchWarning::warning(format!(
                    "Could not read previously fetched elements, references to them are missing: {}",
                    e
                )));
                HashMap::new()
            }
        },
        None => HashMap::new(),
    };
    let fetched_ids: HashSet<ElemId> = index.values().flat_map(|ids| ids.values().cloned()).collect();

    let resolver = ReferenceResolver::new(adapter, index, fallback_index, missing_references);
    for instance in elements.iter_mut().filter_map(Element::as_instance_mut) {
        let Some(rules) = rules_by_type.get(instance.type_name()) else {
            continue;
        };
        warnings.extend(resolver.apply(instance, rules));

        let Some(source) = previous else {
            continue;
        };
        let elem_id = instance.elem_id.clone();
        for rule in rules {
            let Some(value) = get_value_at_mut(&mut instance.value, &rule.field) else {
                continue;
            };
            let targets: Vec<&mut Value> = match value {
                Value::Array(items) => items.iter_mut().collect(),
                single => vec![single],
            };
            for target in targets {
                let Value::Reference(reference @ Reference::Unresolved { .. }) = &*target else {
                    continue;
                };
                if fetched_ids.contains(reference.elem_id()) {
                    continue;
                }
                let resolved = resolve_reference(reference, source).await;
                if resolved.is_missing() {
                    warnings.push(FetchWarning::for_element(
                        &elem_id,
                        format!(
                            "Could not find {} referenced from {}.{}",
                            resolved.elem_id(),
                            elem_id,
                            rule.field
                        ),
                    ));
                }
                *target = Value::Reference(resolved);
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::values_from_json;
    use crate::store::InMemoryElementsSource;
    use serde_json::json;

    fn instance(type_name: &str, name: &str, value: serde_json::Value) -> InstanceElement {
        InstanceElement::new(name, &ElemId::type_id("zendesk", type_name), values_from_json(value))
    }

    #[tokio::test]
    async fn test_resolve_reference_degrades_to_missing() {
        let brand = instance("brand", "main", json!({"id": 1, "name": "Main"}));
        let source = InMemoryElementsSource::from_elements(vec![Element::Instance(brand.clone())]);

        let resolved = resolve_reference(&Reference::new(brand.elem_id.clone()), &source).await;
        assert!(matches!(
            resolved.resolved_element(),
            Some(Element::Instance(i)) if i.value.contains_key("name")
        ));

        let nested = brand.elem_id.create_nested_id(&["name"]);
        let resolved = resolve_reference(&Reference::new(nested), &source).await;
        assert!(matches!(
            resolved.resolved_value(),
            Some(ResolvedValue::Value(v)) if v.as_str() == Some("Main")
        ));

        let gone = ElemId::instance_id("zendesk", "brand", "gone");
        let resolved = resolve_reference(&Reference::new(gone.clone()), &source).await;
        assert!(resolved.is_missing());
        assert_eq!(resolved.elem_id(), &gone);
        println!("✓ Unresolvable references become missing references");
    }

    #[tokio::test]
    async fn test_add_references_with_fallback_and_missing() {
        let mut elements = vec![
            Element::Instance(instance("brand", "main", json!({"id": 1}))),
            Element::Instance(instance(
                "ticket_form",
                "default",
                json!({"id": 10, "brand_ids": [1, 2, 3]}),
            )),
        ];
        let previous = InMemoryElementsSource::from_elements(vec![Element::Instance(instance(
            "brand",
            "secondary",
            json!({"id": 2}),
        ))]);
        let rules = BTreeMap::from([(
            "ticket_form".to_string(),
            vec![FieldReferenceRule {
                field: "brand_ids".to_string(),
                target_type: "brand".to_string(),
            }],
        )]);

        let warnings = add_references("zendesk", &mut elements, &rules, |_| "id".to_string(), Some(&previous), true)
            .await
            .unwrap();

        let form = elements[1].as_instance().unwrap();
        let refs: Vec<&Reference> = form.value["brand_ids"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_reference)
            .collect();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].elem_id().full_name(), "zendesk.brand.instance.main");
        assert_eq!(refs[1].elem_id().full_name(), "zendesk.brand.instance.secondary");
        assert!(!refs[0].is_resolved());
        assert!(matches!(refs[1].resolved_element(), Some(Element::Instance(i)) if i.value.contains_key("id")));
        assert!(refs[2].is_missing());
        assert_eq!(refs[2].elem_id().full_name(), "zendesk.brand.instance.missing_3");
        assert_eq!(warnings.len(), 1);
    }

    struct UnreachableSource;

    #[async_trait::async_trait]
    impl ElementsSource for UnreachableSource {
        async fn get(&self, _id: &ElemId) -> Result<Option<Element>> {
            Err(anyhow::anyhow!("source down"))
        }
        async fn get_all(&self) -> Result<Vec<Element>> {
            Err(anyhow::anyhow!("source down"))
        }
        async fn list(&self) -> Result<Vec<ElemId>> {
            Err(anyhow::anyhow!("source down"))
        }
    }

    #[tokio::test]
    async fn test_unreadable_previous_elements_give_missing_references() {
        let mut elements = vec![Element::Instance(instance(
            "ticket_form",
            "default",
            json!({"id": 10, "brand_id": 2}),
        ))];
        let rules = BTreeMap::from([(
            "ticket_form".to_string(),
            vec![FieldReferenceRule {
                field: "brand_id".to_string(),
                target_type: "brand".to_string(),
            }],
        )]);

        let warnings = add_references(
            "zendesk",
            &mut elements,
            &rules,
            |_| "id".to_string(),
            Some(&UnreachableSource),
            true,
        )
        .await
        .unwrap();

        let form = elements[0].as_instance().unwrap();
        let brand = form.value["brand_id"].as_reference().unwrap();
        assert!(brand.is_missing());
        assert_eq!(brand.elem_id().full_name(), "zendesk.brand.instance.missing_2");
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("source down"));
        println!("✓ Unreadable previous elements degrade to missing references");
    }
}
