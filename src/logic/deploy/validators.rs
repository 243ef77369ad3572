use anyhow::Result;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::client::{collect_all, Paginator};
use crate::config::{AssociatedRecordsRule, EngineConfig, ValidatorsConfig};
use crate::logic::naming::get_value_at;
use crate::logic::references::get_parents;
use crate::logic::transform::{walk_on_value, WalkNextStep, WalkOrder};
use crate::model::{
    annotations, ActionName, Change, ChangeError, ElemId, Element, InstanceElement, ObjectType, Reference, Severity,
    Value,
};
use crate::store::ElementsSource;

/// Pre-flight check over a whole change batch.
///
/// Validators report problems as `ChangeError`s; an `Err` is reserved for
/// failures of the validator itself.
#[async_trait::async_trait]
pub trait ChangeValidator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn validate(
        &self,
        changes: &[Change],
        elements_source: Option<&dyn ElementsSource>,
    ) -> Result<Vec<ChangeError>>;
}

/// Instance changes of the given types.
fn instance_changes<'c>(
    changes: &'c [Change],
    types: &'c [String],
) -> impl Iterator<Item = (&'c Change, &'c InstanceElement)> + 'c {
    changes
        .iter()
        .filter(move |c| types.iter().any(|t| t == c.type_name()))
        .filter_map(|c| c.instance().map(|i| (c, i)))
}

fn removed_ids(changes: &[Change]) -> BTreeSet<&ElemId> {
    changes.iter().filter(|c| c.is_removal()).map(Change::elem_id).collect()
}

fn readable(type_name: &str) -> String {
    type_name.replace('_', " ")
}

async fn object_type_of(source: Option<&dyn ElementsSource>, instance: &InstanceElement) -> Option<ObjectType> {
    let source = source?;
    match source.get(&instance.type_id).await {
        Ok(Some(Element::Type(object_type))) => Some(object_type),
        Ok(_) => None,
        Err(e) => {
            log::warn!("Failed to read type {}: {}", instance.type_id, e);
            None
        }
    }
}

/// Default (system) policies and rules can be neither removed nor deactivated.
/// A default rule may go when its policy is removed in the same batch.
pub struct DefaultPoliciesValidator {
    policy_types: Vec<String>,
    rule_types: Vec<String>,
}

impl DefaultPoliciesValidator {
    pub fn new(policy_types: Vec<String>, rule_types: Vec<String>) -> Self {
        Self {
            policy_types,
            rule_types,
        }
    }
}

#[async_trait::async_trait]
impl ChangeValidator for DefaultPoliciesValidator {
    fn name(&self) -> &'static str {
        "defaultPolicies"
    }

    async fn validate(&self, changes: &[Change], _: Option<&dyn ElementsSource>) -> Result<Vec<ChangeError>> {
        let removed = removed_ids(changes);
        let types: Vec<String> = self.policy_types.iter().chain(&self.rule_types).cloned().collect();
        let errors = instance_changes(changes, &types)
            .filter(|(change, _)| !change.is_addition())
            .filter(|(_, instance)| instance.value.get("system").and_then(Value::as_bool) == Some(true))
            .filter(|(change, instance)| {
                change.is_removal() || instance.value.get("status").and_then(Value::as_str) == Some("INACTIVE")
            })
            .filter(|(change, instance)| {
                let parent_removed = self.rule_types.iter().any(|t| t == instance.type_name())
                    && change.is_removal()
                    && get_parents(instance).iter().any(|p| removed.contains(p));
                !parent_removed
            })
            .map(|(_, instance)| {
                let type_name = readable(instance.type_name());
                ChangeError::error(
                    &instance.elem_id,
                    format!("Cannot remove or deactivate default {}", type_name),
                    format!("Default {} cannot be removed and must be in status ACTIVE", type_name),
                )
            })
            .collect();
        Ok(errors)
    }
}

/// Children of the given types may only be removed together with their parent.
pub struct RemovalWithParentValidator {
    types: Vec<String>,
}

impl RemovalWithParentValidator {
    pub fn new(types: Vec<String>) -> Self {
        Self { types }
    }
}

#[async_trait::async_trait]
impl ChangeValidator for RemovalWithParentValidator {
    fn name(&self) -> &'static str {
        "removalWithParent"
    }

    async fn validate(&self, changes: &[Change], _: Option<&dyn ElementsSource>) -> Result<Vec<ChangeError>> {
        let removed = removed_ids(changes);
        let mut errors = Vec::new();
        for (_, instance) in instance_changes(changes, &self.types).filter(|(c, _)| c.is_removal()) {
            let parents = get_parents(instance);
            if let Some(parent) = parents.iter().find(|p| !removed.contains(p)) {
                let type_name = readable(instance.type_name());
                let parent_type = readable(parent.type_name());
                errors.push(ChangeError::error(
                    &instance.elem_id,
                    format!("Cannot remove {} if its {} is not also being removed", type_name, parent_type),
                    format!("In order to remove this {}, remove its {} as well", type_name, parent_type),
                ));
            }
        }
        Ok(errors)
    }
}

/// Service-id fields and the `_parent` annotation cannot change once created.
pub struct ImmutableFieldsValidator;

#[async_trait::async_trait]
impl ChangeValidator for ImmutableFieldsValidator {
    fn name(&self) -> &'static str {
        "immutableFields"
    }

    async fn validate(
        &self,
        changes: &[Change],
        elements_source: Option<&dyn ElementsSource>,
    ) -> Result<Vec<ChangeError>> {
        let mut errors = Vec::new();
        for change in changes {
            let Change::Modification {
                before: Element::Instance(before),
                after: Element::Instance(after),
            } = change
            else {
                continue;
            };
            let mut changed_fields = Vec::new();
            if let Some(object_type) = object_type_of(elements_source, after).await {
                changed_fields.extend(
                    object_type
                        .fields
                        .values()
                        .filter(|f| f.annotations.get(annotations::SERVICE_ID).and_then(Value::as_bool) == Some(true))
                        .filter(|f| before.value.get(f.name()) != after.value.get(f.name()))
                        .map(|f| f.name().to_string()),
                );
            }
            if before.annotations.get(annotations::PARENT) != after.annotations.get(annotations::PARENT) {
                changed_fields.push(annotations::PARENT.to_string());
            }
            errors.extend(changed_fields.into_iter().map(|field| {
                ChangeError::error(
                    &after.elem_id,
                    "Attempting to modify an immutable field",
                    format!("Field ({}) is immutable", field),
                )
            }));
        }
        Ok(errors)
    }
}

/// Configured fields must be unique per type, compared case-insensitively,
/// across the batch and the elements source.
pub struct UniqueFieldsValidator {
    unique_fields: BTreeMap<String, Vec<String>>,
}

impl UniqueFieldsValidator {
    pub fn new(unique_fields: BTreeMap<String, Vec<String>>) -> Self {
        Self { unique_fields }
    }
}

#[async_trait::async_trait]
impl ChangeValidator for UniqueFieldsValidator {
    fn name(&self) -> &'static str {
        "uniqueFields"
    }

    async fn validate(
        &self,
        changes: &[Change],
        elements_source: Option<&dyn ElementsSource>,
    ) -> Result<Vec<ChangeError>> {
        let relevant: Vec<&InstanceElement> = changes
            .iter()
            .filter(|c| !c.is_removal() && self.unique_fields.contains_key(c.type_name()))
            .filter_map(Change::instance)
            .collect();
        if relevant.is_empty() {
            return Ok(Vec::new());
        }

        // Everything that will exist after the deploy: the batch wins over the source.
        let changed: BTreeSet<&ElemId> = changes.iter().map(Change::elem_id).collect();
        let mut existing: Vec<InstanceElement> = match elements_source {
            Some(source) => source
                .get_all()
                .await?
                .into_iter()
                .filter_map(|e| match e {
                    Element::Instance(i) if self.unique_fields.contains_key(i.type_name()) => Some(i),
                    _ => None,
                })
                .filter(|i| !changed.contains(&i.elem_id))
                .collect(),
            None => Vec::new(),
        };
        existing.extend(relevant.iter().map(|i| (*i).clone()));

        let mut errors = Vec::new();
        for instance in &relevant {
            for field in &self.unique_fields[instance.type_name()] {
                let Some(value) = get_value_at(&instance.value, field).and_then(Value::as_str) else {
                    continue;
                };
                let duplicates: Vec<String> = existing
                    .iter()
                    .filter(|other| other.elem_id != instance.elem_id && other.type_id == instance.type_id)
                    .filter(|other| {
                        get_value_at(&other.value, field)
                            .and_then(Value::as_str)
                            .is_some_and(|v| v.to_lowercase() == value.to_lowercase())
                    })
                    .map(|other| other.elem_id.full_name())
                    .collect();
                if duplicates.is_empty() {
                    continue;
                }
                let type_name = readable(instance.type_name());
                errors.push(ChangeError::error(
                    &instance.elem_id,
                    format!("Cannot do this change since this {} {} is already in use", type_name, field),
                    format!(
                        "The {} {} '{}' is already used by the following elements:\n{}. Please change the {} of the {} and try again.",
                        type_name,
                        field,
                        value,
                        duplicates.join(", "),
                        field,
                        type_name
                    ),
                ));
            }
        }
        Ok(errors)
    }
}

const ASSOCIATED_RECORDS_LIMIT: usize = 10;

/// Removal is blocked while service records still point at the instance.
pub struct AssociatedRecordsValidator {
    config: Arc<EngineConfig>,
    rules: Vec<AssociatedRecordsRule>,
    paginator: Arc<dyn Paginator>,
}

impl AssociatedRecordsValidator {
    pub fn new(config: Arc<EngineConfig>, rules: Vec<AssociatedRecordsRule>, paginator: Arc<dyn Paginator>) -> Self {
        Self {
            config,
            rules,
            paginator,
        }
    }
}

fn json_at<'j>(json: &'j serde_json::Value, dotted_path: &str) -> Option<&'j serde_json::Value> {
    dotted_path.split('.').try_fold(json, |current, segment| current.get(segment))
}

fn json_to_string(json: &serde_json::Value) -> Option<String> {
    match json {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ChangeValidator for AssociatedRecordsValidator {
    fn name(&self) -> &'static str {
        "associatedRecords"
    }

    async fn validate(&self, changes: &[Change], _: Option<&dyn ElementsSource>) -> Result<Vec<ChangeError>> {
        let mut errors = Vec::new();
        for rule in &self.rules {
            let removals: Vec<&InstanceElement> = changes
                .iter()
                .filter(|c| c.is_removal() && c.type_name() == rule.type_name)
                .filter_map(Change::instance)
                .collect();
            if removals.is_empty() {
                continue;
            }

            let records = match collect_all(self.paginator.as_ref(), &rule.request).await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Failed to list records associated with {}: {}", rule.type_name, e);
                    errors.extend(removals.iter().map(|instance| {
                        ChangeError::warning(
                            &instance.elem_id,
                            format!("Could not check records associated with this {}", readable(&rule.type_name)),
                            format!("Listing {} failed: {}", rule.request.url, e),
                        )
                    }));
                    continue;
                }
            };
            let mut by_owner: HashMap<String, Vec<String>> = HashMap::new();
            for record in &records {
                let (Some(owner), Some(display)) = (
                    json_at(record, &rule.match_field).and_then(json_to_string),
                    json_at(record, &rule.display_field).and_then(json_to_string),
                ) else {
                    continue;
                };
                by_owner.entry(owner).or_default().push(display);
            }

            let service_id_field = self.config.service_id_field(&rule.type_name);
            for instance in removals {
                let Some(service_id) = get_value_at(&instance.value, service_id_field).and_then(Value::to_primitive_string)
                else {
                    continue;
                };
                let Some(associated) = by_owner.get(&service_id) else {
                    continue;
                };
                let type_name = readable(&rule.type_name);
                errors.push(ChangeError::error(
                    &instance.elem_id,
                    format!("Cannot remove a {} with associated records", type_name),
                    format!(
                        "{} records are associated with this {} (partial list): [{}].\nPlease disconnect the records from the {} in the service before deploying this change.",
                        associated.len(),
                        type_name,
                        associated.iter().take(ASSOCIATED_RECORDS_LIMIT).join(", "),
                        type_name
                    ),
                ));
            }
        }
        Ok(errors)
    }
}

/// Warns about values that still point at missing elements.
pub struct UnresolvedReferencesValidator;

#[async_trait::async_trait]
impl ChangeValidator for UnresolvedReferencesValidator {
    fn name(&self) -> &'static str {
        "unresolvedReferences"
    }

    async fn validate(&self, changes: &[Change], _: Option<&dyn ElementsSource>) -> Result<Vec<ChangeError>> {
        let mut errors = Vec::new();
        for change in changes.iter().filter(|c| !c.is_removal()) {
            let Some(instance) = change.instance() else {
                continue;
            };
            let mut missing = Vec::new();
            walk_on_value(
                &Value::Object(instance.value.clone()),
                &instance.elem_id,
                WalkOrder::TopDown,
                &mut |value, path| {
                    if let Value::Reference(Reference::Missing { elem_id, raw }) = value {
                        missing.push((path.clone(), elem_id.clone(), raw.clone()));
                    }
                    WalkNextStep::Continue
                },
            );
            errors.extend(missing.into_iter().map(|(path, target, raw)| {
                ChangeError::warning(
                    &instance.elem_id,
                    "Element references a missing element",
                    format!(
                        "{} references {} which does not exist (value '{}'); it will be deployed as is",
                        path, target, raw
                    ),
                )
            }));
        }
        Ok(errors)
    }
}

/// Rejects actions a type declares unsupported via `_creatable`, `_updatable`
/// or `_deletable` set to `false`.
pub struct DeploymentActionsValidator;

#[async_trait::async_trait]
impl ChangeValidator for DeploymentActionsValidator {
    fn name(&self) -> &'static str {
        "deploymentActions"
    }

    async fn validate(
        &self,
        changes: &[Change],
        elements_source: Option<&dyn ElementsSource>,
    ) -> Result<Vec<ChangeError>> {
        let mut errors = Vec::new();
        for change in changes {
            let Some(instance) = change.instance() else {
                continue;
            };
            let Some(object_type) = object_type_of(elements_source, instance).await else {
                continue;
            };
            let (annotation, verb) = match change.action() {
                ActionName::Add => (annotations::CREATABLE, "Adding"),
                ActionName::Modify => (annotations::UPDATABLE, "Modifying"),
                ActionName::Remove => (annotations::DELETABLE, "Removing"),
            };
            if object_type.annotations.get(annotation).and_then(Value::as_bool) == Some(false) {
                errors.push(ChangeError::error(
                    &instance.elem_id,
                    "Action not supported",
                    format!("{} instances of {} is not supported", verb, instance.type_name()),
                ));
            }
        }
        Ok(errors)
    }
}

/// The validators enabled by `config`, in a fixed order.
pub fn validators_from_config(
    config: Arc<EngineConfig>,
    paginator: Arc<dyn Paginator>,
) -> Vec<Box<dyn ChangeValidator>> {
    let ValidatorsConfig {
        policy_types,
        policy_rule_types,
        removal_with_parent_types,
        unique_fields,
        associated_records,
        ..
    } = config.deploy.validators.clone();

    let mut validators: Vec<Box<dyn ChangeValidator>> = vec![
        Box::new(DeploymentActionsValidator),
        Box::new(ImmutableFieldsValidator),
        Box::new(UnresolvedReferencesValidator),
    ];
    if !policy_types.is_empty() || !policy_rule_types.is_empty() {
        validators.push(Box::new(DefaultPoliciesValidator::new(policy_types, policy_rule_types)));
    }
    if !removal_with_parent_types.is_empty() {
        validators.push(Box::new(RemovalWithParentValidator::new(removal_with_parent_types)));
    }
    if !unique_fields.is_empty() {
        validators.push(Box::new(UniqueFieldsValidator::new(unique_fields)));
    }
    if !associated_records.is_empty() {
        validators.push(Box::new(AssociatedRecordsValidator::new(
            config.clone(),
            associated_records,
            paginator,
        )));
    }
    validators
}

/// Whether an error of this severity keeps its change from deploying.
pub fn is_blocking(severity: Severity, fail_on_warnings: bool) -> bool {
    match severity {
        Severity::Error => true,
        Severity::Warning => fail_on_warnings,
        Severity::Info => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FetchRequest, InMemoryPaginator};
    use crate::model::{values_from_json, Field, PrimitiveKind, TypeRef};
    use crate::store::InMemoryElementsSource;
    use serde_json::json;

    fn instance(type_name: &str, name: &str, value: serde_json::Value) -> InstanceElement {
        InstanceElement::new(name, &ElemId::type_id("okta", type_name), values_from_json(value))
    }

    fn with_parent(instance: InstanceElement, parent: &InstanceElement) -> InstanceElement {
        instance.with_annotation(
            annotations::PARENT,
            Value::Array(vec![Value::reference(parent.elem_id.clone())]),
        )
    }

    fn policies() -> DefaultPoliciesValidator {
        DefaultPoliciesValidator::new(vec!["AccessPolicy".to_string()], vec!["AccessPolicyRule".to_string()])
    }

    #[tokio::test]
    async fn test_default_policies() {
        let default_policy = instance("AccessPolicy", "default", json!({"system": true, "status": "ACTIVE"}));
        let inactive = instance("AccessPolicy", "default", json!({"system": true, "status": "INACTIVE"}));
        let custom = instance("AccessPolicy", "custom", json!({"system": false}));

        let errors = policies()
            .validate(
                &[
                    Change::modification(default_policy.clone(), inactive),
                    Change::removal(custom),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Cannot remove or deactivate default AccessPolicy");
        assert_eq!(
            errors[0].detailed_message,
            "Default AccessPolicy cannot be removed and must be in status ACTIVE"
        );

        let errors = policies()
            .validate(&[Change::modification(default_policy.clone(), default_policy)], None)
            .await
            .unwrap();
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_default_rule_removed_with_its_policy() {
        let policy = instance("AccessPolicy", "custom", json!({"system": false}));
        let rule = with_parent(instance("AccessPolicyRule", "default_rule", json!({"system": true})), &policy);

        let errors = policies()
            .validate(&[Change::removal(rule.clone()), Change::removal(policy)], None)
            .await
            .unwrap();
        assert!(errors.is_empty());

        let errors = policies().validate(&[Change::removal(rule)], None).await.unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_removal_with_parent() {
        let validator = RemovalWithParentValidator::new(vec!["brand_theme".to_string()]);
        let brand = instance("brand", "main", json!({}));
        let theme = with_parent(instance("brand_theme", "dark", json!({})), &brand);

        let errors = validator
            .validate(&[Change::removal(theme.clone()), Change::removal(brand)], None)
            .await
            .unwrap();
        assert!(errors.is_empty());

        let errors = validator.validate(&[Change::removal(theme)], None).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Cannot remove brand theme if its brand is not also being removed"
        );
        assert_eq!(
            errors[0].detailed_message,
            "In order to remove this brand theme, remove its brand as well"
        );
        println!("✓ Child removal requires removing the parent");
    }

    #[tokio::test]
    async fn test_immutable_fields() {
        let type_id = ElemId::type_id("okta", "Group");
        let mut group_type = ObjectType::new(type_id.clone());
        group_type.add_field(
            Field::new(&type_id, "id", TypeRef::Primitive(PrimitiveKind::String))
                .with_annotation(annotations::SERVICE_ID, true),
        );
        let source = InMemoryElementsSource::from_elements(vec![Element::Type(group_type)]);

        let before = instance("Group", "admins", json!({"id": "1", "name": "a"}));
        let after = instance("Group", "admins", json!({"id": "2", "name": "b"}));
        let errors = ImmutableFieldsValidator
            .validate(&[Change::modification(before.clone(), after)], Some(&source))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].detailed_message, "Field (id) is immutable");

        let parent = instance("Group", "other", json!({}));
        let moved = with_parent(before.clone(), &parent);
        let errors = ImmutableFieldsValidator
            .validate(&[Change::modification(before, moved)], Some(&source))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].detailed_message, "Field (_parent) is immutable");
    }

    #[tokio::test]
    async fn test_unique_fields_case_insensitive() {
        let validator = UniqueFieldsValidator::new(BTreeMap::from([(
            "dynamic_content_item".to_string(),
            vec!["name".to_string()],
        )]));
        let existing = instance("dynamic_content_item", "greeting", json!({"name": "Greeting"}));
        let source = InMemoryElementsSource::from_elements(vec![Element::Instance(existing.clone())]);

        let new_item = instance("dynamic_content_item", "greeting_2", json!({"name": "greeting"}));
        let errors = validator
            .validate(&[Change::addition(new_item.clone())], Some(&source))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Cannot do this change since this dynamic content item name is already in use"
        );
        assert!(errors[0]
            .detailed_message
            .contains("okta.dynamic_content_item.instance.greeting"));

        // Renaming the existing one in the same batch frees the name.
        let renamed = instance("dynamic_content_item", "greeting", json!({"name": "Hello"}));
        let errors = validator
            .validate(
                &[Change::addition(new_item), Change::modification(existing, renamed)],
                Some(&source),
            )
            .await
            .unwrap();
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_associated_records() {
        let config = Arc::new(EngineConfig::default());
        let paginator = InMemoryPaginator::new().with_pages(
            "/api/v2/users",
            vec![vec![
                json!({"email": "a@example.com", "custom_role_id": 7}),
                json!({"email": "b@example.com", "custom_role_id": 7}),
                json!({"email": "c@example.com", "custom_role_id": 8}),
            ]],
        );
        let validator = AssociatedRecordsValidator::new(
            config,
            vec![AssociatedRecordsRule {
                type_name: "custom_role".to_string(),
                request: FetchRequest::new("/api/v2/users"),
                match_field: "custom_role_id".to_string(),
                display_field: "email".to_string(),
            }],
            Arc::new(paginator),
        );
        let role = instance("custom_role", "agents", json!({"id": 7}));
        let unused = instance("custom_role", "unused", json!({"id": 9}));

        let errors = validator
            .validate(&[Change::removal(role), Change::removal(unused)], None)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Cannot remove a custom role with associated records");
        assert!(errors[0]
            .detailed_message
            .starts_with("2 records are associated with this custom role (partial list): [a@example.com, b@example.com]"));
    }

    #[tokio::test]
    async fn test_unresolved_references_warn() {
        let mut form = instance("ticket_form", "default", json!({}));
        form.value.insert(
            "brand_id".to_string(),
            Value::Reference(Reference::missing("okta", "brand", "3")),
        );
        let errors = UnresolvedReferencesValidator
            .validate(&[Change::addition(form)], None)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Warning);
        assert!(!is_blocking(errors[0].severity, false));
        assert!(is_blocking(errors[0].severity, true));
    }

    #[tokio::test]
    async fn test_deployment_actions() {
        let mut group_type = ObjectType::new(ElemId::type_id("okta", "Group"));
        group_type
            .annotations
            .insert(annotations::DELETABLE.to_string(), Value::Bool(false));
        let source = InMemoryElementsSource::from_elements(vec![Element::Type(group_type)]);
        let group = instance("Group", "admins", json!({}));

        let errors = DeploymentActionsValidator
            .validate(&[Change::removal(group.clone()), Change::addition(group)], Some(&source))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].detailed_message, "Removing instances of Group is not supported");
    }
}
