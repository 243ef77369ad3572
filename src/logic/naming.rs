use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::model::{Value, Values};

const UNNAMED: &str = "unnamed";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("valid placeholder pattern"));

/// Make a service-side name safe for use as an element id segment.
///
/// Letters, digits and `_` are kept; every other character becomes `_`.
/// Leading and trailing separators are trimmed.
pub fn nacl_case(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        UNNAMED.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Read a dotted path (`settings.locale`) from element values.
pub fn get_value_at<'v>(values: &'v Values, dotted_path: &str) -> Option<&'v Value> {
    let mut segments = dotted_path.split('.');
    let mut current = values.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn get_value_at_mut<'v>(values: &'v mut Values, dotted_path: &str) -> Option<&'v mut Value> {
    let mut segments = dotted_path.split('.');
    let mut current = values.get_mut(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Fill `{dotted.path}` placeholders of a URL template from element values.
/// Fails when a placeholder has no primitive value.
pub fn render_template(template: &str, values: &Values) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(path)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = get_value_at(values, path.as_str())
            .and_then(Value::to_primitive_string)
            .ok_or_else(|| anyhow!("No value for '{}' in template '{}'", path.as_str(), template))?;
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&value);
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// Name part contributed by one id field value. References contribute the
/// name of their target.
fn name_part(value: &Value) -> Option<String> {
    match value {
        Value::Reference(reference) => Some(reference.elem_id().name().to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
        primitive => primitive.to_primitive_string().filter(|s| !s.is_empty()),
    }
}

/// Raw instance name from the configured id fields, joined with `_`.
/// `None` when none of the fields has a usable value.
pub fn get_instance_name(values: &Values, id_fields: &[String]) -> Option<String> {
    let parts: Vec<String> = id_fields
        .iter()
        .filter_map(|path| get_value_at(values, path))
        .filter_map(name_part)
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("_"))
    }
}

/// Hands out element names per type, appending a counter on collisions
/// (`name`, `name_2`, `name_3`, ...).
#[derive(Debug, Default)]
pub struct NameAllocator {
    used: HashMap<String, HashSet<String>>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, type_name: &str, base: &str) -> String {
        let used = self.used.entry(type_name.to_string()).or_default();
        let base = nacl_case(base);
        if used.insert(base.clone()) {
            return base;
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{}_{}", base, counter);
            if used.insert(candidate.clone()) {
                log::debug!("Name '{}' of type {} already taken, using '{}'", base, type_name, candidate);
                return candidate;
            }
            counter += 1;
        }
    }
}
