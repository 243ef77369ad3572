use anyhow::Result;

use crate::error::EngineError;
use crate::model::{
    ElemId, Element, Field, ObjectType, Reference, ResolvedValue, TypeRef, TypeRegistry, Value, Values,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Fail on values whose field is not defined on a known type.
    pub strict: bool,
    /// Keep arrays that end up empty after the transform.
    pub allow_empty_arrays: bool,
    /// Keep objects that were already empty before their children were transformed.
    pub allow_existing_empty_objects: bool,
}

impl TransformOptions {
    /// Non-strict options that keep empty containers, used when reshaping
    /// values for deployment.
    pub fn lenient() -> Self {
        Self {
            strict: false,
            allow_empty_arrays: true,
            allow_existing_empty_objects: true,
        }
    }
}

/// What the transform callback sees for each node.
pub struct TransformArgs<'a> {
    pub value: Value,
    pub path: &'a ElemId,
    pub field: Option<&'a Field>,
}

struct Transformer<'r, F> {
    registry: &'r TypeRegistry,
    options: TransformOptions,
    func: F,
}

impl<'r, F> Transformer<'r, F>
where
    F: FnMut(TransformArgs<'_>) -> Result<Option<Value>>,
{
    fn transform_map(
        &mut self,
        values: Values,
        object_type: Option<&'r ObjectType>,
        map_field: Option<(&'r TypeRef, Option<&'r Field>)>,
        path: &ElemId,
    ) -> Result<Values> {
        let mut result = Values::new();
        for (key, value) in values {
            let (field, field_type) = match (map_field, object_type) {
                (Some((item_type, field)), _) => (field, Some(item_type)),
                (None, Some(object_type)) => {
                    let field = object_type.fields.get(&key);
                    if field.is_none() && self.options.strict {
                        return Err(EngineError::UnknownField {
                            type_name: object_type.elem_id.full_name(),
                            field: key,
                        }
                        .into());
                    }
                    (field, field.map(|f| &f.field_type))
                }
                (None, None) => (None, None),
            };
            let child_path = path.create_nested_id(&[key.as_str()]);
            if let Some(new_value) = self.transform_value(value, field, field_type, &child_path)? {
                result.insert(key, new_value);
            }
        }
        Ok(result)
    }

    fn transform_value(
        &mut self,
        value: Value,
        field: Option<&'r Field>,
        field_type: Option<&'r TypeRef>,
        path: &ElemId,
    ) -> Result<Option<Value>> {
        let new_value = match (self.func)(TransformArgs { value, path, field })? {
            Some(v) => v,
            None => return Ok(None),
        };

        match new_value {
            Value::Array(items) => {
                let item_type = match field_type {
                    Some(TypeRef::List(inner)) => Some(inner.as_ref()),
                    other => other,
                };
                let mut result = Vec::with_capacity(items.len());
                for (idx, item) in items.into_iter().enumerate() {
                    let item_path = path.create_nested_id(&[idx.to_string()]);
                    if let Some(v) = self.transform_value(item, field, item_type, &item_path)? {
                        result.push(v);
                    }
                }
                if result.is_empty() && !self.options.allow_empty_arrays {
                    Ok(None)
                } else {
                    Ok(Some(Value::Array(result)))
                }
            }
            Value::Object(map) => {
                let was_empty = map.is_empty();
                let result = match field_type {
                    Some(TypeRef::Object(type_id)) => {
                        let registry = self.registry;
                        self.transform_map(map, registry.get(type_id), None, path)?
                    }
                    Some(TypeRef::Map(inner)) => self.transform_map(map, None, Some((inner.as_ref(), field)), path)?,
                    _ => self.transform_map(map, None, None, path)?,
                };
                if result.is_empty() && !(self.options.allow_existing_empty_objects && was_empty) {
                    Ok(None)
                } else {
                    Ok(Some(Value::Object(result)))
                }
            }
            other => Ok(Some(other)),
        }
    }
}

/// Deep-map a value tree through `func`, top-down.
///
/// `func` runs on a node before its children; returning `None` deletes the
/// node, otherwise the returned value replaces it and its children are
/// transformed in turn. Field definitions are looked up in `registry`
/// starting from `object_type`.
pub fn transform_values<F>(
    values: Values,
    object_type: Option<&ObjectType>,
    registry: &TypeRegistry,
    path: &ElemId,
    options: TransformOptions,
    func: F,
) -> Result<Values>
where
    F: FnMut(TransformArgs<'_>) -> Result<Option<Value>>,
{
    let mut transformer = Transformer {
        registry,
        options,
        func,
    };
    transformer.transform_map(values, object_type, None, path)
}

/// Transform every value of an element: instance values and annotations, or
/// type and field annotations. Annotations are always transformed non-strictly.
pub fn transform_element<F>(
    element: &Element,
    registry: &TypeRegistry,
    options: TransformOptions,
    func: F,
) -> Result<Element>
where
    F: FnMut(TransformArgs<'_>) -> Result<Option<Value>>,
{
    let mut transformer = Transformer {
        registry,
        options,
        func,
    };
    let annotation_options = TransformOptions {
        strict: false,
        ..options
    };

    let mut result = element.clone();
    match &mut result {
        Element::Instance(instance) => {
            let object_type = registry.get(&instance.type_id);
            let value = std::mem::take(&mut instance.value);
            instance.value = transformer.transform_map(value, object_type, None, &instance.elem_id)?;
            transformer.options = annotation_options;
            let annotations = std::mem::take(&mut instance.annotations);
            instance.annotations = transformer.transform_map(annotations, None, None, &instance.elem_id)?;
        }
        Element::Type(object_type) => {
            transformer.options = annotation_options;
            let annotations = std::mem::take(&mut object_type.annotations);
            object_type.annotations = transformer.transform_map(annotations, None, None, &object_type.elem_id)?;
            for field in object_type.fields.values_mut() {
                let annotations = std::mem::take(&mut field.annotations);
                field.annotations = transformer.transform_map(annotations, None, None, &field.elem_id)?;
            }
        }
        Element::Field(field) => {
            transformer.options = annotation_options;
            let annotations = std::mem::take(&mut field.annotations);
            field.annotations = transformer.transform_map(annotations, None, None, &field.elem_id)?;
        }
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkNextStep {
    /// Visit the children of a container.
    Continue,
    /// Do not descend below this node.
    Skip,
    /// Visit the children, and also the cached target of a resolved reference.
    Recurse,
    /// Stop the whole walk.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    TopDown,
    /// Children before parents; the returned step only matters for `Exit`.
    BottomUp,
}

/// Walk a value tree emitting `(value, path)` to `func`.
pub fn walk_on_value<F>(value: &Value, path: &ElemId, order: WalkOrder, func: &mut F)
where
    F: FnMut(&Value, &ElemId) -> WalkNextStep,
{
    walk(value, path, order, func);
}

/// Walk all values of an element (instance values and annotations, or type
/// and field annotations). The element itself is not emitted.
pub fn walk_on_element<F>(element: &Element, order: WalkOrder, func: &mut F)
where
    F: FnMut(&Value, &ElemId) -> WalkNextStep,
{
    walk_element(element, order, func);
}

// Each walker returns false once the walk was exited.
fn walk<F>(value: &Value, path: &ElemId, order: WalkOrder, func: &mut F) -> bool
where
    F: FnMut(&Value, &ElemId) -> WalkNextStep,
{
    match order {
        WalkOrder::TopDown => match func(value, path) {
            WalkNextStep::Exit => false,
            WalkNextStep::Skip => true,
            WalkNextStep::Continue => walk_children(value, path, order, false, func),
            WalkNextStep::Recurse => walk_children(value, path, order, true, func),
        },
        WalkOrder::BottomUp => {
            walk_children(value, path, order, false, func) && func(value, path) != WalkNextStep::Exit
        }
    }
}

fn walk_children<F>(value: &Value, path: &ElemId, order: WalkOrder, follow_references: bool, func: &mut F) -> bool
where
    F: FnMut(&Value, &ElemId) -> WalkNextStep,
{
    match value {
        Value::Object(map) => walk_map(map, path, order, func),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .all(|(idx, item)| walk(item, &path.create_nested_id(&[idx.to_string()]), order, func)),
        Value::Reference(Reference::Resolved { elem_id, value }) if follow_references => match value {
            ResolvedValue::Value(target) => walk(target, elem_id, order, func),
            ResolvedValue::Element(element) => walk_element(element, order, func),
        },
        _ => true,
    }
}

fn walk_map<F>(map: &Values, path: &ElemId, order: WalkOrder, func: &mut F) -> bool
where
    F: FnMut(&Value, &ElemId) -> WalkNextStep,
{
    map.iter()
        .all(|(key, value)| walk(value, &path.create_nested_id(&[key.as_str()]), order, func))
}

fn walk_element<F>(element: &Element, order: WalkOrder, func: &mut F) -> bool
where
    F: FnMut(&Value, &ElemId) -> WalkNextStep,
{
    match element {
        Element::Instance(instance) => {
            walk_map(&instance.value, &instance.elem_id, order, func)
                && walk_map(&instance.annotations, &instance.elem_id, order, func)
        }
        Element::Type(object_type) => {
            walk_map(&object_type.annotations, &object_type.elem_id, order, func)
                && object_type
                    .fields
                    .values()
                    .all(|field| walk_map(&field.annotations, &field.elem_id, order, func))
        }
        Element::Field(field) => walk_map(&field.annotations, &field.elem_id, order, func),
    }
}

/// Root value map of `element` addressed by `id`, plus the remaining path.
fn path_root<'e>(element: &'e Element, id: &ElemId) -> Option<(&'e Values, Vec<String>)> {
    match element {
        Element::Instance(instance) => {
            let (top, path) = id.create_top_level_parent_id();
            (top == instance.elem_id).then_some((&instance.value, path))
        }
        Element::Type(object_type) => {
            let (top, path) = id.create_top_level_parent_id();
            if top != object_type.elem_id {
                return None;
            }
            match path.split_first() {
                None => Some((&object_type.annotations, Vec::new())),
                Some((kind, rest)) if kind == "attr" || kind == "annotation" => {
                    Some((&object_type.annotations, rest.to_vec()))
                }
                Some((kind, rest)) if kind == "field" => {
                    let (name, rest) = rest.split_first()?;
                    let field = object_type.fields.get(name)?;
                    Some((&field.annotations, rest.to_vec()))
                }
                _ => None,
            }
        }
        Element::Field(field) => field_relative_path(&field.elem_id, id).map(|path| (&field.annotations, path)),
    }
}

fn path_root_mut<'e>(element: &'e mut Element, id: &ElemId) -> Option<(&'e mut Values, Vec<String>)> {
    match element {
        Element::Instance(instance) => {
            let (top, path) = id.create_top_level_parent_id();
            (top == instance.elem_id).then_some((&mut instance.value, path))
        }
        Element::Type(object_type) => {
            let (top, path) = id.create_top_level_parent_id();
            if top != object_type.elem_id {
                return None;
            }
            match path.split_first() {
                None => Some((&mut object_type.annotations, Vec::new())),
                Some((kind, rest)) if kind == "attr" || kind == "annotation" => {
                    Some((&mut object_type.annotations, rest.to_vec()))
                }
                Some((kind, rest)) if kind == "field" => {
                    let (name, rest) = rest.split_first()?;
                    let field = object_type.fields.get_mut(name)?;
                    Some((&mut field.annotations, rest.to_vec()))
                }
                _ => None,
            }
        }
        Element::Field(field) => {
            let path = field_relative_path(&field.elem_id, id)?;
            Some((&mut field.annotations, path))
        }
    }
}

fn field_relative_path(field_id: &ElemId, id: &ElemId) -> Option<Vec<String>> {
    if id == field_id || field_id.is_parent_of(id) {
        Some(id.name_parts()[field_id.name_parts().len()..].to_vec())
    } else {
        None
    }
}

fn get_in_values<'v>(values: &'v Values, path: &[String]) -> Option<&'v Value> {
    let (first, rest) = path.split_first()?;
    let mut current = values.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Read the value addressed by `id` inside `element`.
///
/// The element's own id yields its value map (or annotations for types and
/// fields) as an object. Returns `None` when the path does not exist.
pub fn resolve_path(element: &Element, id: &ElemId) -> Option<Value> {
    let (root, path) = path_root(element, id)?;
    if path.is_empty() {
        return Some(Value::Object(root.clone()));
    }
    get_in_values(root, &path).cloned()
}

/// Write (`Some`) or delete (`None`) the value addressed by `id` inside `element`.
///
/// Missing intermediate objects are created on write. Deleting a path that
/// does not exist is a no-op.
pub fn set_path(element: &mut Element, id: &ElemId, value: Option<Value>) -> Result<()> {
    let root_id = element.elem_id().full_name();
    let invalid = || EngineError::InvalidPath {
        root: root_id.clone(),
        path: id.full_name(),
    };

    let (root, path) = path_root_mut(element, id).ok_or_else(invalid)?;
    if path.is_empty() {
        return match value {
            Some(Value::Object(map)) => {
                *root = map;
                Ok(())
            }
            _ => Err(invalid().into()),
        };
    }
    if set_in_values(root, &path, value) {
        Ok(())
    } else {
        Err(invalid().into())
    }
}

// Returns false when the path runs through a non-container value.
fn set_in_values(values: &mut Values, path: &[String], value: Option<Value>) -> bool {
    let Some((first, rest)) = path.split_first() else {
        return false;
    };
    if rest.is_empty() {
        match value {
            Some(v) => {
                values.insert(first.clone(), v);
            }
            None => {
                values.remove(first);
            }
        }
        return true;
    }
    if value.is_none() && !values.contains_key(first) {
        return true;
    }
    let child = values.entry(first.clone()).or_insert_with(Value::object);
    set_in_value(child, rest, value)
}

fn set_in_value(target: &mut Value, path: &[String], value: Option<Value>) -> bool {
    match target {
        Value::Object(map) => set_in_values(map, path, value),
        Value::Array(items) => {
            let Some((first, rest)) = path.split_first() else {
                return false;
            };
            let Ok(idx) = first.parse::<usize>() else {
                return false;
            };
            if rest.is_empty() {
                return match value {
                    Some(v) if idx < items.len() => {
                        items[idx] = v;
                        true
                    }
                    Some(v) if idx == items.len() => {
                        items.push(v);
                        true
                    }
                    Some(_) => false,
                    None => {
                        if idx < items.len() {
                            items.remove(idx);
                        }
                        true
                    }
                };
            }
            match items.get_mut(idx) {
                Some(item) => set_in_value(item, rest, value),
                None => value.is_none(),
            }
        }
        _ => value.is_none(),
    }
}
