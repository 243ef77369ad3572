use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::model::elem_id::ElemId;
use crate::model::value::{Reference, Value, Values};

/// Reserved annotation names shared by all adapters.
pub mod annotations {
    pub const ALIAS: &str = "_alias";
    pub const SERVICE_URL: &str = "_service_url";
    pub const PARENT: &str = "_parent";
    pub const REQUIRED: &str = "_required";
    pub const RESTRICTION: &str = "_restriction";
    pub const HIDDEN_VALUE: &str = "_hidden_value";
    pub const CREATABLE: &str = "_creatable";
    pub const UPDATABLE: &str = "_updatable";
    pub const DELETABLE: &str = "_deletable";
    /// Marks a field as holding the service-side identifier.
    pub const SERVICE_ID: &str = "_service_id";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    String,
    Number,
    Boolean,
    Unknown,
}

/// Type of a field, by reference to the type id rather than by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeRef {
    Primitive(PrimitiveKind),
    Object(ElemId),
    List(Box<TypeRef>),
    Map(Box<TypeRef>),
}

impl TypeRef {
    pub fn list_of(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    /// Type of the items for container types, `self` otherwise.
    pub fn inner(&self) -> &TypeRef {
        match self {
            TypeRef::List(inner) | TypeRef::Map(inner) => inner.inner(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub elem_id: ElemId,
    pub parent_type: ElemId,
    pub field_type: TypeRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Values,
}

impl Field {
    pub fn new(parent_type: &ElemId, name: &str, field_type: TypeRef) -> Self {
        Self {
            elem_id: ElemId::field_id(parent_type.adapter(), parent_type.type_name(), name),
            parent_type: parent_type.clone(),
            field_type,
            annotations: Values::new(),
        }
    }

    pub fn with_annotation(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.annotations.insert(name.to_string(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        self.elem_id.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectType {
    pub elem_id: ElemId,
    #[serde(default)]
    pub fields: BTreeMap<String, Field>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Values,
    /// Singleton configuration type with at most one instance.
    #[serde(default)]
    pub is_settings: bool,
}

impl ObjectType {
    pub fn new(elem_id: ElemId) -> Self {
        Self {
            elem_id,
            fields: BTreeMap::new(),
            annotations: Values::new(),
            is_settings: false,
        }
    }

    pub fn with_field(mut self, name: &str, field_type: TypeRef) -> Self {
        let field = Field::new(&self.elem_id, name, field_type);
        self.fields.insert(name.to_string(), field);
        self
    }

    pub fn add_field(&mut self, field: Field) {
        self.fields.insert(field.name().to_string(), field);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceElement {
    pub elem_id: ElemId,
    /// Id of the instance's type; types may be fetched separately.
    pub type_id: ElemId,
    #[serde(default)]
    pub value: Values,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Values,
}

impl InstanceElement {
    pub fn new(name: &str, type_id: &ElemId, value: Values) -> Self {
        Self {
            elem_id: ElemId::instance_id(type_id.adapter(), type_id.type_name(), name),
            type_id: type_id.clone(),
            value,
            annotations: Values::new(),
        }
    }

    pub fn with_annotation(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.annotations.insert(name.to_string(), value.into());
        self
    }

    pub fn type_name(&self) -> &str {
        self.type_id.type_name()
    }

    /// References held by the `_parent` annotation, in order.
    pub fn parents(&self) -> Vec<&Reference> {
        match self.annotations.get(annotations::PARENT) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_reference).collect(),
            Some(Value::Reference(reference)) => vec![reference],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    Type(ObjectType),
    Instance(InstanceElement),
    Field(Field),
}

impl Element {
    pub fn elem_id(&self) -> &ElemId {
        match self {
            Element::Type(t) => &t.elem_id,
            Element::Instance(i) => &i.elem_id,
            Element::Field(f) => &f.elem_id,
        }
    }

    pub fn annotations(&self) -> &Values {
        match self {
            Element::Type(t) => &t.annotations,
            Element::Instance(i) => &i.annotations,
            Element::Field(f) => &f.annotations,
        }
    }

    pub fn annotations_mut(&mut self) -> &mut Values {
        match self {
            Element::Type(t) => &mut t.annotations,
            Element::Instance(i) => &mut i.annotations,
            Element::Field(f) => &mut f.annotations,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceElement> {
        match self {
            Element::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut InstanceElement> {
        match self {
            Element::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&ObjectType> {
        match self {
            Element::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_type_mut(&mut self) -> Option<&mut ObjectType> {
        match self {
            Element::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, Element::Instance(_))
    }

    /// Type name an element belongs to: the instance's type, or the type itself.
    pub fn type_name(&self) -> &str {
        self.elem_id().type_name()
    }

    pub fn alias(&self) -> Option<&str> {
        self.annotations().get(annotations::ALIAS).and_then(Value::as_str)
    }
}

impl From<ObjectType> for Element {
    fn from(t: ObjectType) -> Self {
        Element::Type(t)
    }
}

impl From<InstanceElement> for Element {
    fn from(i: InstanceElement) -> Self {
        Element::Instance(i)
    }
}

/// Lookup of object types by id, used by the transform engine to find field
/// definitions while walking instance values.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<ElemId, ObjectType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements<'a>(elements: impl IntoIterator<Item = &'a Element>) -> Self {
        let mut registry = Self::new();
        for element in elements {
            if let Element::Type(t) = element {
                registry.insert(t.clone());
            }
        }
        registry
    }

    pub fn insert(&mut self, object_type: ObjectType) {
        self.types.insert(object_type.elem_id.clone(), object_type);
    }

    pub fn get(&self, id: &ElemId) -> Option<&ObjectType> {
        self.types.get(id)
    }

    pub fn get_by_name(&self, adapter: &str, type_name: &str) -> Option<&ObjectType> {
        self.types.get(&ElemId::type_id(adapter, type_name))
    }

    /// Field definition for a `field` id.
    pub fn get_field(&self, field_id: &ElemId) -> Option<&Field> {
        let object_type = self.types.get(&field_id.type_elem_id())?;
        object_type.fields.get(field_id.name_parts().first()?)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
