use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::logic::filter::FetchWarning;
use crate::logic::graph::{nodes_on_cycles, topological_sort};
use crate::logic::naming::get_value_at;
use crate::logic::references::resolve_reference;
use crate::model::{annotations, ElemId, Element, Reference, Value, Values};
use crate::store::ElementsSource;

const DEFAULT_SEPARATOR: &str = " ";

/// One part of an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AliasComponent {
    Constant {
        constant: String,
    },
    Field {
        /// Dotted path; paths starting with an annotation name (`_parent.0`) read annotations
        field_name: String,
        /// Read this from the referenced element instead; `_alias` reads its alias
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference_field_name: Option<String>,
        /// Use the raw field value when it is not a resolvable reference
        #[serde(default)]
        use_field_value_as_fallback: bool,
    },
}

impl AliasComponent {
    pub fn constant(value: impl Into<String>) -> Self {
        AliasComponent::Constant { constant: value.into() }
    }

    pub fn field(field_name: impl Into<String>) -> Self {
        AliasComponent::Field {
            field_name: field_name.into(),
            reference_field_name: None,
            use_field_value_as_fallback: false,
        }
    }

    pub fn reference(field_name: impl Into<String>, reference_field_name: impl Into<String>) -> Self {
        AliasComponent::Field {
            field_name: field_name.into(),
            reference_field_name: Some(reference_field_name.into()),
            use_field_value_as_fallback: false,
        }
    }

    pub fn with_fallback(self) -> Self {
        match self {
            AliasComponent::Field {
                field_name,
                reference_field_name,
                ..
            } => AliasComponent::Field {
                field_name,
                reference_field_name,
                use_field_value_as_fallback: true,
            },
            constant => constant,
        }
    }

    fn alias_reference_field(&self) -> Option<&str> {
        match self {
            AliasComponent::Field {
                field_name,
                reference_field_name: Some(reference_field_name),
                ..
            } if reference_field_name == annotations::ALIAS => Some(field_name),
            _ => None,
        }
    }
}

/// Alias rule of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasData {
    pub alias_components: Vec<AliasComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

impl AliasData {
    pub fn new(alias_components: Vec<AliasComponent>) -> Self {
        Self {
            alias_components,
            separator: None,
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    fn separator(&self) -> &str {
        self.separator.as_deref().unwrap_or(DEFAULT_SEPARATOR)
    }
}

/// Values an alias component path reads from. Annotation names start with `_`.
fn component_value<'e>(element: &'e Element, field_name: &str) -> Option<&'e Value> {
    let values: &Values = match element {
        Element::Instance(instance) if !field_name.starts_with('_') => &instance.value,
        other => other.annotations(),
    };
    get_value_at(values, field_name)
}

fn references_at<'e>(element: &'e Element, field_name: &str) -> Vec<&'e Reference> {
    match component_value(element, field_name) {
        Some(Value::Reference(reference)) => vec![reference],
        _ => Vec::new(),
    }
}

/// Everything alias computation may look at.
struct AliasContext<'a> {
    elements: &'a [Element],
    by_id: HashMap<ElemId, usize>,
    external: HashMap<ElemId, Element>,
    computed: HashMap<ElemId, Option<String>>,
}

impl<'a> AliasContext<'a> {
    fn element(&self, id: &ElemId) -> Option<&Element> {
        self.by_id
            .get(id)
            .map(|idx| &self.elements[*idx])
            .or_else(|| self.external.get(id))
    }

    fn target_alias(&self, reference: &Reference) -> Option<String> {
        let (id, _) = reference.elem_id().create_top_level_parent_id();
        if let Some(computed) = self.computed.get(&id) {
            return computed.clone();
        }
        self.element(&id)
            .or_else(|| reference.resolved_element())
            .and_then(Element::alias)
            .map(str::to_string)
    }

    fn target_field(&self, reference: &Reference, field: &str) -> Option<String> {
        let (id, _) = reference.elem_id().create_top_level_parent_id();
        let target = self.element(&id).or_else(|| reference.resolved_element())?;
        let value = component_value(target, field)?;
        match value {
            Value::Reference(_) => None,
            primitive => primitive.to_primitive_string(),
        }
    }

    fn component(&self, element: &Element, component: &AliasComponent) -> Option<String> {
        let (field_name, reference_field_name, use_fallback) = match component {
            AliasComponent::Constant { constant } => return Some(constant.clone()),
            AliasComponent::Field {
                field_name,
                reference_field_name,
                use_field_value_as_fallback,
            } => (field_name, reference_field_name, *use_field_value_as_fallback),
        };
        let value = component_value(element, field_name)?;
        let Some(reference_field_name) = reference_field_name else {
            return match value {
                Value::Reference(_) => None,
                primitive => primitive.to_primitive_string(),
            };
        };
        match value {
            Value::Reference(reference) => {
                let resolved = if reference_field_name == annotations::ALIAS {
                    self.target_alias(reference)
                } else {
                    self.target_field(reference, reference_field_name)
                };
                match (resolved, reference) {
                    (Some(resolved), _) => Some(resolved),
                    (None, Reference::Missing { raw, .. }) if use_fallback => Some(raw.clone()),
                    (None, _) => None,
                }
            }
            primitive if use_fallback => primitive.to_primitive_string(),
            _ => None,
        }
    }

    /// Components that cannot be computed are left out and the rest are
    /// joined; there is no alias only when every component is empty.
    fn alias(&self, element: &Element, alias_data: &AliasData) -> Option<String> {
        let parts: Vec<String> = alias_data
            .alias_components
            .iter()
            .filter_map(|component| self.component(element, component))
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(alias_data.separator()))
        }
    }
}

/// Set the `_alias` annotation on every element whose type has an alias rule.
///
/// Elements whose alias depends on another element's alias are computed
/// after their targets. Targets outside the batch are read from `source`.
/// Elements on an alias cycle get no alias and a warning.
pub async fn add_alias_to_elements(
    elements: &mut [Element],
    alias_map: &BTreeMap<String, AliasData>,
    source: Option<&dyn ElementsSource>,
) -> Result<Vec<FetchWarning>> {
    let nodes: BTreeSet<usize> = elements
        .iter()
        .enumerate()
        .filter(|(_, e)| !matches!(e, Element::Field(_)) && alias_map.contains_key(e.type_name()))
        .map(|(idx, _)| idx)
        .collect();
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let by_id: HashMap<ElemId, usize> = elements
        .iter()
        .enumerate()
        .map(|(idx, e)| (e.elem_id().clone(), idx))
        .collect();

    // Targets not in the batch: looked up once, up front.
    let mut external = HashMap::new();
    if let Some(source) = source {
        let mut wanted = BTreeSet::new();
        for idx in &nodes {
            let element = &elements[*idx];
            for component in &alias_map[element.type_name()].alias_components {
                if let AliasComponent::Field {
                    field_name,
                    reference_field_name: Some(_),
                    ..
                } = component
                {
                    for reference in references_at(element, field_name) {
                        let (target, _) = reference.elem_id().create_top_level_parent_id();
                        if !by_id.contains_key(&target) {
                            wanted.insert(target);
                        }
                    }
                }
            }
        }
        for id in wanted {
            let target = resolve_reference(&Reference::new(id.clone()), source).await;
            match target.resolved_element() {
                Some(element) => {
                    external.insert(id, element.clone());
                }
                None => log::debug!("Alias target {} not found in elements source", id),
            }
        }
    }

    let mut dependencies: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for idx in &nodes {
        let element = &elements[*idx];
        for component in &alias_map[element.type_name()].alias_components {
            let Some(field_name) = component.alias_reference_field() else {
                continue;
            };
            for reference in references_at(element, field_name) {
                let (target, _) = reference.elem_id().create_top_level_parent_id();
                if let Some(target_idx) = by_id.get(&target).filter(|t| nodes.contains(*t)) {
                    dependencies.entry(*idx).or_default().insert(*target_idx);
                }
            }
        }
    }

    let mut warnings = Vec::new();
    let mut remaining = nodes;
    let mut cyclic = BTreeSet::new();
    let order = loop {
        match topological_sort(&remaining, &dependencies) {
            Ok(order) => break order,
            Err(stuck) => {
                let on_cycle = nodes_on_cycles(&stuck, &dependencies);
                for idx in &on_cycle {
                    let elem_id = elements[*idx].elem_id();
                    log::warn!("Alias of {} depends on itself, leaving it unset", elem_id);
                    warnings.push(FetchWarning::for_element(
                        elem_id,
                        format!("Could not compute alias of {}: circular alias reference", elem_id),
                    ));
                    remaining.remove(idx);
                }
                cyclic.extend(on_cycle);
            }
        }
    };

    let mut aliases: Vec<(usize, Option<String>)> = Vec::with_capacity(order.len());
    {
        let view: &[Element] = elements;
        let mut context = AliasContext {
            elements: view,
            by_id,
            external,
            computed: cyclic
                .iter()
                .map(|idx| (view[*idx].elem_id().clone(), None))
                .collect(),
        };
        for idx in order {
            let element = &view[idx];
            let alias = context.alias(element, &alias_map[element.type_name()]);
            if alias.is_none() {
                log::debug!("No alias could be computed for {}", element.elem_id());
            }
            context.computed.insert(element.elem_id().clone(), alias.clone());
            aliases.push((idx, alias));
        }
    }

    for (idx, alias) in aliases {
        if let Some(alias) = alias {
            elements[idx]
                .annotations_mut()
                .insert(annotations::ALIAS.to_string(), Value::String(alias));
        }
    }
    Ok(warnings)
}
