use std::collections::BTreeMap;

use crate::config::{EngineConfig, StandaloneField};
use crate::logic::naming::{get_instance_name, get_value_at, NameAllocator};
use crate::model::{
    annotations, ElemId, Element, Field, IdType, InstanceElement, ObjectType, PrimitiveKind, TypeRef, Value, Values,
};

/// Builds object types and instances from raw service records.
///
/// Types are inferred from the shape of the records. Nested objects become
/// `<type>__<field>` types, except for standalone fields which become
/// instances of their own type, linked back with a `_parent` annotation.
pub struct ElementsBuilder<'a> {
    config: &'a EngineConfig,
    names: NameAllocator,
    types: BTreeMap<String, ObjectType>,
    instances: Vec<InstanceElement>,
}

impl<'a> ElementsBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            names: NameAllocator::new(),
            types: BTreeMap::new(),
            instances: Vec::new(),
        }
    }

    fn adapter(&self) -> &str {
        &self.config.adapter
    }

    fn type_id(&self, type_name: &str) -> ElemId {
        ElemId::type_id(self.adapter(), type_name)
    }

    fn standalone_field(&self, type_name: &str, field: &str) -> Option<&'a StandaloneField> {
        self.config
            .type_config(type_name)?
            .standalone_fields
            .iter()
            .find(|s| s.field == field)
    }

    fn object_type_mut(&mut self, type_name: &str) -> &mut ObjectType {
        let type_id = self.type_id(type_name);
        let config = self.config.type_config(type_name);
        self.types.entry(type_name.to_string()).or_insert_with(|| {
            let mut object_type = ObjectType::new(type_id);
            object_type.is_settings = config.is_some_and(|c| c.is_settings);
            object_type
        })
    }

    /// Add the records of one fetched type.
    pub fn add_records(&mut self, type_name: &str, records: Vec<serde_json::Value>) {
        self.object_type_mut(type_name);
        for record in records {
            match record {
                serde_json::Value::Object(map) => {
                    self.infer_fields(type_name, &map);
                    self.add_instance(type_name, map, None);
                }
                other => log::warn!("Skipping non-object record of type {}: {}", type_name, other),
            }
        }
    }

    fn infer_fields(&mut self, type_name: &str, record: &serde_json::Map<String, serde_json::Value>) {
        let service_id_field = self.config.service_id_field(type_name).to_string();
        for (key, value) in record {
            let field_type = self.infer_type_ref(type_name, key, value);
            let object_type = self.object_type_mut(type_name);
            let type_id = object_type.elem_id.clone();
            match object_type.fields.get_mut(key) {
                Some(existing) => existing.field_type = merge_type_refs(&existing.field_type, field_type),
                None => {
                    let mut field = Field::new(&type_id, key, field_type);
                    if *key == service_id_field {
                        field.annotations.insert(annotations::SERVICE_ID.to_string(), Value::Bool(true));
                    }
                    object_type.add_field(field);
                }
            }
        }
    }

    fn infer_type_ref(&mut self, type_name: &str, field: &str, value: &serde_json::Value) -> TypeRef {
        match value {
            serde_json::Value::Null => TypeRef::Primitive(PrimitiveKind::Unknown),
            serde_json::Value::Bool(_) => TypeRef::Primitive(PrimitiveKind::Boolean),
            serde_json::Value::Number(_) => TypeRef::Primitive(PrimitiveKind::Number),
            serde_json::Value::String(_) => TypeRef::Primitive(PrimitiveKind::String),
            serde_json::Value::Array(items) => {
                let item_type = items
                    .iter()
                    .map(|item| self.infer_type_ref(type_name, field, item))
                    .reduce(|a, b| merge_type_refs(&a, b))
                    .unwrap_or(TypeRef::Primitive(PrimitiveKind::Unknown));
                TypeRef::list_of(item_type)
            }
            serde_json::Value::Object(map) => {
                let nested_type = match self.standalone_field(type_name, field) {
                    Some(standalone) => standalone.type_name.clone(),
                    None => format!("{}__{}", type_name, field),
                };
                self.object_type_mut(&nested_type);
                self.infer_fields(&nested_type, map);
                TypeRef::Object(self.type_id(&nested_type))
            }
        }
    }

    fn instance_name(&mut self, type_name: &str, values: &Values, parent_name: Option<&str>) -> Option<String> {
        let type_config = self.config.type_config(type_name);
        if type_config.is_some_and(|c| c.is_settings) {
            return None;
        }
        let id_fields = type_config.map(|c| c.id_fields.as_slice()).unwrap_or_default();
        let service_id_field = self.config.service_id_field(type_name);
        let base = get_instance_name(values, id_fields)
            .or_else(|| get_value_at(values, service_id_field).and_then(Value::to_primitive_string))
            .unwrap_or_else(|| type_name.to_string());
        let base = match parent_name {
            Some(parent) if type_config.is_some_and(|c| c.extends_parent_id) => format!("{}__{}", parent, base),
            _ => base,
        };
        Some(self.names.allocate(type_name, &base))
    }

    fn add_instance(
        &mut self,
        type_name: &str,
        record: serde_json::Map<String, serde_json::Value>,
        parent: Option<&ElemId>,
    ) -> ElemId {
        let mut values: Values = record.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect();
        let type_id = self.type_id(type_name);
        let elem_id = match self.instance_name(type_name, &values, parent.map(|p| p.name())) {
            Some(name) => ElemId::instance_id(type_id.adapter(), type_name, name),
            None => ElemId::new(type_id.adapter(), type_name, IdType::Instance, Vec::new()),
        };

        let standalone_fields: Vec<StandaloneField> = self
            .config
            .type_config(type_name)
            .map(|c| c.standalone_fields.clone())
            .unwrap_or_default();
        for standalone in standalone_fields {
            if let Some(value) = values.remove(&standalone.field) {
                let replaced = self.extract_standalone(&standalone, value, &elem_id);
                values.insert(standalone.field.clone(), replaced);
            }
        }

        let mut instance = InstanceElement {
            elem_id: elem_id.clone(),
            type_id,
            value: values,
            annotations: Values::new(),
        };
        if let Some(parent) = parent {
            instance.annotations.insert(
                annotations::PARENT.to_string(),
                Value::Array(vec![Value::reference(parent.clone())]),
            );
        }
        self.instances.push(instance);
        elem_id
    }

    /// Turn nested records into child instances, returning the references
    /// that replace them in the parent.
    fn extract_standalone(&mut self, standalone: &StandaloneField, value: Value, parent: &ElemId) -> Value {
        match value {
            Value::Object(map) => {
                let record = crate::model::values_to_json(&map);
                match record {
                    serde_json::Value::Object(record) => {
                        Value::reference(self.add_instance(&standalone.type_name, record, Some(parent)))
                    }
                    _ => Value::Object(map),
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.extract_standalone(standalone, item, parent))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Types first, then instances in the order they were added.
    pub fn build(self) -> Vec<Element> {
        let mut elements: Vec<Element> = self.types.into_values().map(Element::Type).collect();
        elements.extend(self.instances.into_iter().map(Element::Instance));
        elements
    }
}

/// Combine two observations of a field's type; disagreeing primitives become unknown.
fn merge_type_refs(existing: &TypeRef, new: TypeRef) -> TypeRef {
    match (existing, new) {
        (a, b) if *a == b => b,
        (TypeRef::Primitive(PrimitiveKind::Unknown), b) => b,
        (a, TypeRef::Primitive(PrimitiveKind::Unknown)) => a.clone(),
        (TypeRef::List(a), TypeRef::List(b)) => TypeRef::list_of(merge_type_refs(a, *b)),
        _ => TypeRef::Primitive(PrimitiveKind::Unknown),
    }
}
