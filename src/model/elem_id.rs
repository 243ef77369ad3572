use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub const NAMESPACE_SEPARATOR: &str = ".";
/// Type name of the adapter configuration type, and name of singleton instances.
pub const CONFIG_NAME: &str = "_config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    Type,
    Field,
    Attr,
    Annotation,
    Instance,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::Type => "type",
            IdType::Field => "field",
            IdType::Attr => "attr",
            IdType::Annotation => "annotation",
            IdType::Instance => "instance",
        }
    }
}

impl FromStr for IdType {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "type" => Ok(IdType::Type),
            "field" => Ok(IdType::Field),
            "attr" => Ok(IdType::Attr),
            "annotation" => Ok(IdType::Annotation),
            "instance" => Ok(IdType::Instance),
            other => Err(EngineError::InvalidElemId(
                other.to_string(),
                format!("invalid id type '{}'", other),
            )),
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name parts may hold any text: `%` and `.` are percent escaped in full
/// names, and an empty part is written as a lone `%`.
fn escape_name_part(part: &str) -> Cow<'_, str> {
    if part.is_empty() {
        return Cow::Borrowed("%");
    }
    if !part.contains(['%', '.']) {
        return Cow::Borrowed(part);
    }
    Cow::Owned(part.replace('%', "%25").replace('.', "%2E"))
}

/// Unknown `%` sequences are kept as written.
fn unescape_name_part(part: &str) -> String {
    if part == "%" {
        return String::new();
    }
    let mut unescaped = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        unescaped.push_str(&rest[..pos]);
        let escape = &rest[pos..];
        if escape.starts_with("%25") {
            unescaped.push('%');
            rest = &escape[3..];
        } else if escape.starts_with("%2E") || escape.starts_with("%2e") {
            unescaped.push('.');
            rest = &escape[3..];
        } else {
            unescaped.push('%');
            rest = &escape[1..];
        }
    }
    unescaped.push_str(rest);
    unescaped
}

/// Hierarchical identifier of an element or of a value nested inside one.
///
/// The canonical string form ("full name") is the dot separated list of
/// `adapter.type[.id_type.name_parts...]`. Type ids never carry name parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElemId {
    adapter: String,
    type_name: String,
    id_type: IdType,
    name_parts: Vec<String>,
}

impl ElemId {
    pub fn new(
        adapter: impl Into<String>,
        type_name: impl Into<String>,
        id_type: IdType,
        name_parts: Vec<String>,
    ) -> Self {
        let type_name = type_name.into();
        let type_name = if type_name.is_empty() {
            CONFIG_NAME.to_string()
        } else {
            type_name
        };
        let name_parts = match id_type {
            IdType::Type => Vec::new(),
            IdType::Instance if name_parts.is_empty() => vec![CONFIG_NAME.to_string()],
            _ => name_parts,
        };
        Self {
            adapter: adapter.into(),
            type_name,
            id_type,
            name_parts,
        }
    }

    pub fn type_id(adapter: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(adapter, type_name, IdType::Type, Vec::new())
    }

    pub fn instance_id(
        adapter: impl Into<String>,
        type_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(adapter, type_name, IdType::Instance, vec![name.into()])
    }

    pub fn field_id(
        adapter: impl Into<String>,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
    ) -> Self {
        Self::new(adapter, type_name, IdType::Field, vec![field_name.into()])
    }

    /// Parse a full name produced by [`ElemId::full_name`].
    pub fn from_full_name(full_name: &str) -> Result<Self> {
        let invalid = |reason: &str| EngineError::InvalidElemId(full_name.to_string(), reason.to_string());

        let parts: Vec<&str> = full_name.split(NAMESPACE_SEPARATOR).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty name segment").into());
        }
        match parts.as_slice() {
            [adapter] => Ok(Self::type_id(*adapter, CONFIG_NAME)),
            [adapter, type_name] => Ok(Self::type_id(*adapter, *type_name)),
            [adapter, type_name, id_type, rest @ ..] => {
                let id_type: IdType = id_type.parse()?;
                match id_type {
                    IdType::Type => Err(invalid("type ids cannot have name parts").into()),
                    IdType::Instance => Ok(Self::new(
                        *adapter,
                        *type_name,
                        id_type,
                        rest.iter().map(|p| unescape_name_part(p)).collect(),
                    )),
                    _ if rest.is_empty() => Err(invalid("missing name").into()),
                    _ => Ok(Self::new(
                        *adapter,
                        *type_name,
                        id_type,
                        rest.iter().map(|p| unescape_name_part(p)).collect(),
                    )),
                }
            }
            [] => Err(invalid("empty id").into()),
        }
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    pub fn name_parts(&self) -> &[String] {
        &self.name_parts
    }

    pub fn full_name_parts(&self) -> Vec<Cow<'_, str>> {
        let mut parts = vec![Cow::Borrowed(self.adapter.as_str())];
        match self.id_type {
            IdType::Type if self.type_name == CONFIG_NAME => {}
            IdType::Type => parts.push(Cow::Borrowed(self.type_name.as_str())),
            IdType::Instance if self.is_settings_instance() => {
                parts.push(Cow::Borrowed(self.type_name.as_str()));
                parts.push(Cow::Borrowed(self.id_type.as_str()));
            }
            _ => {
                parts.push(Cow::Borrowed(self.type_name.as_str()));
                parts.push(Cow::Borrowed(self.id_type.as_str()));
                parts.extend(self.name_parts.iter().map(|p| escape_name_part(p)));
            }
        }
        parts
    }

    pub fn full_name(&self) -> String {
        self.full_name_parts().join(NAMESPACE_SEPARATOR)
    }

    /// The last segment of the full name.
    pub fn name(&self) -> &str {
        match self.id_type {
            IdType::Type if self.type_name == CONFIG_NAME => &self.adapter,
            IdType::Type => &self.type_name,
            _ => self
                .name_parts
                .last()
                .map(|p| p.as_str())
                .unwrap_or(&self.type_name),
        }
    }

    /// Adapter configuration type, or an instance of it.
    pub fn is_config(&self) -> bool {
        self.type_name == CONFIG_NAME
    }

    /// Singleton ("settings") instance of a settings type.
    pub fn is_settings_instance(&self) -> bool {
        self.id_type == IdType::Instance
            && self.name_parts.len() == 1
            && self.name_parts[0] == CONFIG_NAME
    }

    pub fn is_top_level(&self) -> bool {
        match self.id_type {
            IdType::Type => true,
            IdType::Instance => self.name_parts.len() == 1,
            _ => false,
        }
    }

    pub fn is_attr_id(&self) -> bool {
        self.id_type == IdType::Attr
    }

    /// Id of a value nested below this one.
    ///
    /// Below a type id the first part names the nested id type (`field`,
    /// `attr` or `annotation`); anything else is taken as an attribute name.
    pub fn create_nested_id<S: AsRef<str>>(&self, parts: &[S]) -> Self {
        if parts.is_empty() {
            return self.clone();
        }
        let parts: Vec<String> = parts.iter().map(|p| p.as_ref().to_string()).collect();
        if self.id_type == IdType::Type {
            return match parts[0].parse::<IdType>() {
                Ok(id_type) if !matches!(id_type, IdType::Type | IdType::Instance) && parts.len() > 1 => {
                    Self::new(&self.adapter, &self.type_name, id_type, parts[1..].to_vec())
                }
                _ => Self::new(&self.adapter, &self.type_name, IdType::Attr, parts),
            };
        }
        let mut name_parts = self.name_parts.clone();
        name_parts.extend(parts);
        Self::new(&self.adapter, &self.type_name, self.id_type, name_parts)
    }

    /// Id one level up; top level ids are their own parent.
    pub fn create_parent_id(&self) -> Self {
        if self.is_top_level() {
            return self.clone();
        }
        if self.name_parts.len() <= 1 {
            return Self::type_id(&self.adapter, &self.type_name);
        }
        let parts = self.name_parts[..self.name_parts.len() - 1].to_vec();
        Self::new(&self.adapter, &self.type_name, self.id_type, parts)
    }

    /// Top level element id holding this id, plus the path from it.
    ///
    /// `parent.create_nested_id(&path) == self` always holds.
    pub fn create_top_level_parent_id(&self) -> (ElemId, Vec<String>) {
        if self.is_top_level() {
            return (self.clone(), Vec::new());
        }
        match self.id_type {
            IdType::Instance => (
                Self::new(
                    &self.adapter,
                    &self.type_name,
                    IdType::Instance,
                    vec![self.name_parts[0].clone()],
                ),
                self.name_parts[1..].to_vec(),
            ),
            _ => {
                let mut path = vec![self.id_type.as_str().to_string()];
                path.extend(self.name_parts.iter().cloned());
                (Self::type_id(&self.adapter, &self.type_name), path)
            }
        }
    }

    /// Whether `other` is nested strictly below this id.
    pub fn is_parent_of(&self, other: &ElemId) -> bool {
        let (other_parent, other_path) = other.create_top_level_parent_id();
        let (self_parent, self_path) = self.create_top_level_parent_id();
        self_parent == other_parent
            && other_path.len() > self_path.len()
            && other_path.starts_with(&self_path)
    }

    pub fn type_elem_id(&self) -> ElemId {
        Self::type_id(&self.adapter, &self.type_name)
    }
}

impl fmt::Display for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

impl FromStr for ElemId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_full_name(s)
    }
}

impl Serialize for ElemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full_name())
    }
}

impl<'de> Deserialize<'de> for ElemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let full_name = String::deserialize(deserializer)?;
        ElemId::from_full_name(&full_name).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name_round_trip() {
        let ids = vec![
            ElemId::type_id("zendesk", "ticket_field"),
            ElemId::type_id("zendesk", ""),
            ElemId::instance_id("zendesk", "ticket_field", "priority"),
            ElemId::new("zendesk", "brand_settings", IdType::Instance, vec![]),
            ElemId::field_id("okta", "Policy", "name"),
            ElemId::instance_id("okta", "Policy", "default")
                .create_nested_id(&["conditions", "people", "0"]),
            ElemId::type_id("okta", "Policy").create_nested_id(&["_alias"]),
            ElemId::type_id("okta", "Policy").create_nested_id(&["field", "status", "_required"]),
        ];

        for id in ids {
            let full_name = id.full_name();
            let parsed = ElemId::from_full_name(&full_name).unwrap();
            assert_eq!(parsed, id, "round trip failed for {}", full_name);
        }
        println!("✓ Full names round trip losslessly");
    }

    #[test]
    fn test_name_parts_with_separators() {
        let layout = ElemId::instance_id("netsuite", "role", "Admin.Layout");
        assert_eq!(layout.full_name(), "netsuite.role.instance.Admin%2ELayout");
        assert_eq!(layout.name(), "Admin.Layout");
        assert!(layout.is_top_level());

        let tricky = ["Admin.Layout", "", "%", "%2E", "50%.off", "..", "a%25b"];
        for part in tricky {
            let id = ElemId::instance_id("netsuite", "role", part).create_nested_id(&["x.y", part]);
            let parsed = ElemId::from_full_name(&id.full_name()).unwrap();
            assert_eq!(parsed, id, "round trip failed for {:?}", part);
            assert_eq!(parsed.create_top_level_parent_id().0.name(), part);
        }

        let empty = ElemId::instance_id("netsuite", "role", "");
        assert_eq!(empty.full_name(), "netsuite.role.instance.%");
        assert_ne!(empty, ElemId::new("netsuite", "role", IdType::Instance, vec![]));
        println!("✓ Dotted and empty name parts keep their identity");
    }

    #[test]
    fn test_config_names_are_omitted() {
        let config_type = ElemId::type_id("jira", "");
        assert_eq!(config_type.full_name(), "jira");
        assert!(config_type.is_config());

        let settings = ElemId::new("jira", "Settings", IdType::Instance, vec![]);
        assert_eq!(settings.full_name(), "jira.Settings.instance");
        assert!(settings.is_settings_instance());
        assert!(!settings.is_config());
        println!("✓ Config and settings ids render without the config name");
    }

    #[test]
    fn test_invalid_full_names() {
        assert!(ElemId::from_full_name("okta.Policy.bogus.x").is_err());
        assert!(ElemId::from_full_name("okta..instance").is_err());
        assert!(ElemId::from_full_name("okta.Policy.field").is_err());
        assert!(ElemId::from_full_name("okta.Policy.type.x").is_err());
        println!("✓ Malformed full names are rejected");
    }

    #[test]
    fn test_nested_and_top_level_parent() {
        let instance = ElemId::instance_id("okta", "Policy", "default");
        let nested = instance.create_nested_id(&["conditions", "people"]);
        assert_eq!(nested.full_name(), "okta.Policy.instance.default.conditions.people");
        assert!(!nested.is_top_level());

        let (parent, path) = nested.create_top_level_parent_id();
        assert_eq!(parent, instance);
        assert_eq!(path, vec!["conditions", "people"]);
        assert_eq!(parent.create_nested_id(&path), nested);
        assert!(instance.is_parent_of(&nested));
        assert!(!nested.is_parent_of(&instance));

        let field_annotation = ElemId::field_id("okta", "Policy", "status").create_nested_id(&["_required"]);
        let (parent, path) = field_annotation.create_top_level_parent_id();
        assert_eq!(parent, ElemId::type_id("okta", "Policy"));
        assert_eq!(path, vec!["field", "status", "_required"]);
        assert_eq!(parent.create_nested_id(&path), field_annotation);
        assert_eq!(field_annotation.create_parent_id().create_parent_id(), parent);
        println!("✓ Nested ids resolve back to their top level parent");
    }

    #[test]
    fn test_serde_as_string() {
        let id = ElemId::instance_id("zendesk", "macro", "close_ticket");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"zendesk.macro.instance.close_ticket\"");
        let back: ElemId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.name(), "close_ticket");
    }
}
