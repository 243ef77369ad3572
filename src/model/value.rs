use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::model::element::Element;
use crate::model::elem_id::ElemId;

pub type Values = BTreeMap<String, Value>;

pub const REF_KEY: &str = "$ref";
pub const MISSING_KEY: &str = "$missing";
pub const MISSING_REF_PREFIX: &str = "missing_";

/// A value inside an element: JSON-like data plus references to other elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Values),
    Reference(Reference),
}

/// Target of a resolved reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Element(Box<Element>),
    Value(Box<Value>),
}

/// A pointer to another element (or a value nested in one).
///
/// Equality only compares the target id.
#[derive(Debug, Clone)]
pub enum Reference {
    /// Points at a known id but has not been looked up yet.
    Unresolved { elem_id: ElemId },
    /// Looked up successfully; carries a snapshot of the target.
    Resolved {
        elem_id: ElemId,
        value: ResolvedValue,
    },
    /// The target record was not found. `raw` is the service-side identifier.
    Missing { elem_id: ElemId, raw: String },
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.elem_id() == other.elem_id() && self.is_missing() == other.is_missing()
    }
}

impl Reference {
    pub fn new(elem_id: ElemId) -> Self {
        Reference::Unresolved { elem_id }
    }

    /// Reference to a record that was not fetched, e.g. `okta.User.instance.missing_00u123`.
    pub fn missing(adapter: &str, type_name: &str, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let elem_id = ElemId::instance_id(
            adapter,
            type_name,
            format!("{}{}", MISSING_REF_PREFIX, crate::logic::naming::nacl_case(&raw)),
        );
        Reference::Missing { elem_id, raw }
    }

    pub fn elem_id(&self) -> &ElemId {
        match self {
            Reference::Unresolved { elem_id }
            | Reference::Resolved { elem_id, .. }
            | Reference::Missing { elem_id, .. } => elem_id,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Reference::Missing { .. })
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Reference::Resolved { .. })
    }

    pub fn resolved_value(&self) -> Option<&ResolvedValue> {
        match self {
            Reference::Resolved { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Cached target element, when the reference points at a whole element.
    pub fn resolved_element(&self) -> Option<&Element> {
        match self.resolved_value() {
            Some(ResolvedValue::Element(element)) => Some(element),
            _ => None,
        }
    }

    /// Drop the cached target, keeping only the id.
    pub fn unresolve(&self) -> Reference {
        match self {
            Reference::Resolved { elem_id, .. } => Reference::Unresolved {
                elem_id: elem_id.clone(),
            },
            other => other.clone(),
        }
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn object() -> Self {
        Value::Object(Values::new())
    }

    pub fn reference(elem_id: ElemId) -> Self {
        Value::Reference(Reference::new(elem_id))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Values> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Values> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Primitive rendered as a string, the way services compare identifiers.
    pub fn to_primitive_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Convert to plain JSON. References become `{"$ref": "<full name>"}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Reference(reference) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    REF_KEY.to_string(),
                    serde_json::Value::String(reference.elem_id().full_name()),
                );
                if let Reference::Missing { raw, .. } = reference {
                    map.insert(MISSING_KEY.to_string(), serde_json::Value::String(raw.clone()));
                }
                serde_json::Value::Object(map)
            }
        }
    }

    /// Convert plain JSON, recognizing the reference encoding of [`Value::to_json`].
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => {
                if let Some(reference) = parse_reference(&map) {
                    return Value::Reference(reference);
                }
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }
}

fn parse_reference(map: &serde_json::Map<String, serde_json::Value>) -> Option<Reference> {
    let full_name = map.get(REF_KEY)?.as_str()?;
    let elem_id = ElemId::from_full_name(full_name).ok()?;
    match (map.len(), map.get(MISSING_KEY)) {
        (1, None) => Some(Reference::new(elem_id)),
        (2, Some(serde_json::Value::String(raw))) => Some(Reference::Missing {
            elem_id,
            raw: raw.clone(),
        }),
        _ => None,
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Value::Reference(reference)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

/// Convert a JSON object into element values. Non-objects yield an empty map.
pub fn values_from_json(json: serde_json::Value) -> Values {
    match Value::from_json(json) {
        Value::Object(map) => map,
        _ => Values::new(),
    }
}

pub fn values_to_json(values: &Values) -> serde_json::Value {
    serde_json::Value::Object(values.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}
