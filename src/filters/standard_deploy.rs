use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::client::{DeployClient, DeployRequest};
use crate::config::{EndpointConfig, EngineConfig};
use crate::filters::registry_for_changes;
use crate::logic::deploy::{filter_ignored_values, IgnoredValues};
use crate::logic::filter::{DeployFilterResult, Filter, FilterOptions};
use crate::logic::naming::{get_value_at, render_template};
use crate::logic::transform::{resolve_path, walk_on_value, WalkNextStep, WalkOrder};
use crate::model::{ActionName, Change, DeployError, ElemId, InstanceElement, Reference, TypeRegistry, Value, Values};
use crate::store::ElementsSource;

/// Deploys instance changes of types with a configured endpoint, one request
/// per change. Other changes are left for the next filter.
pub struct StandardDeployFilter {
    config: Arc<EngineConfig>,
    client: Arc<dyn DeployClient>,
    elements_source: Arc<dyn ElementsSource>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(StandardDeployFilter {
        config: options.config.clone(),
        client: options.client.clone(),
        elements_source: options.elements_source.clone(),
    })
}

/// Wrap a request body in `body_field` when the endpoint expects it.
pub(crate) fn wrap_body(body: serde_json::Value, body_field: Option<&str>) -> serde_json::Value {
    match body_field {
        Some(field) => {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(field.to_string(), body);
            serde_json::Value::Object(wrapped)
        }
        None => body,
    }
}

fn reference_ids(values: &Values, root: &ElemId) -> BTreeSet<ElemId> {
    let mut ids = BTreeSet::new();
    walk_on_value(&Value::Object(values.clone()), root, WalkOrder::TopDown, &mut |value, _| {
        if let Value::Reference(reference) = value {
            if !reference.is_missing() {
                ids.insert(reference.elem_id().clone());
            }
        }
        WalkNextStep::Continue
    });
    ids
}

/// Convert values to the service's JSON, references becoming the service
/// id of their target and missing references their raw value.
fn to_service_json(value: &Value, targets: &HashMap<ElemId, serde_json::Value>) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Reference(Reference::Missing { raw, .. }) => serde_json::Value::String(raw.clone()),
        Value::Reference(reference) => targets
            .get(reference.elem_id())
            .cloned()
            .ok_or_else(|| anyhow!("Reference to {} cannot be resolved", reference.elem_id()))?,
        Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| to_service_json(item, targets))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, item)| Ok((key.clone(), to_service_json(item, targets)?)))
                .collect::<Result<_>>()?,
        ),
        primitive => primitive.to_json(),
    })
}

impl StandardDeployFilter {
    fn endpoint(&self, change: &Change) -> Option<&EndpointConfig> {
        let endpoints = self.config.deploy.endpoints.get(change.type_name())?;
        match change.action() {
            ActionName::Add => endpoints.add.as_ref(),
            ActionName::Modify => endpoints.modify.as_ref(),
            ActionName::Remove => endpoints.remove.as_ref(),
        }
    }

    /// Service-side value of every element the instance references.
    async fn reference_targets(&self, instance: &InstanceElement) -> Result<HashMap<ElemId, serde_json::Value>> {
        let mut targets = HashMap::new();
        for id in reference_ids(&instance.value, &instance.elem_id) {
            let (top_level_id, path) = id.create_top_level_parent_id();
            let Some(target) = self.elements_source.get(&top_level_id).await? else {
                continue;
            };
            let value = if path.is_empty() {
                let field = self.config.service_id_field(id.type_name());
                target
                    .as_instance()
                    .and_then(|t| get_value_at(&t.value, field))
                    .map(Value::to_json)
            } else {
                resolve_path(&target, &id).map(|v| v.to_json())
            };
            if let Some(value) = value {
                targets.insert(id, value);
            }
        }
        Ok(targets)
    }

    async fn deploy_change(&self, mut change: Change, endpoint: &EndpointConfig, registry: &TypeRegistry) -> Result<Change> {
        let instance = change
            .instance()
            .ok_or_else(|| anyhow!("Only instance changes can be deployed"))?;
        let url = render_template(&endpoint.url, &instance.value)?;
        let body = if change.is_removal() {
            None
        } else {
            let filtered = filter_ignored_values(
                instance,
                IgnoredValues::Names(&self.config.deploy.ignored_fields),
                &[],
                registry,
            )?;
            let targets = self.reference_targets(&filtered).await?;
            let body = to_service_json(&Value::Object(filtered.value), &targets)?;
            Some(wrap_body(body, endpoint.body_field.as_deref()))
        };

        log::debug!("Deploying {} with {:?} {}", instance.elem_id, endpoint.method, url);
        let response = self
            .client
            .send(DeployRequest {
                method: endpoint.method,
                url,
                body,
            })
            .await?;

        if change.is_addition() {
            let id_field = self.config.service_id_field(change.type_name()).to_string();
            let assigned = endpoint
                .body_field
                .as_deref()
                .and_then(|field| response.body.get(field))
                .and_then(|wrapped| wrapped.get(&id_field))
                .or_else(|| response.body.get(&id_field))
                .cloned();
            if let (Some(assigned), Some(instance)) = (assigned, change.instance_mut()) {
                instance.value.entry(id_field).or_insert_with(|| Value::from_json(assigned));
            }
        }
        Ok(change)
    }
}

#[async_trait::async_trait]
impl Filter for StandardDeployFilter {
    fn name(&self) -> &'static str {
        "standardDeploy"
    }

    async fn deploy(&self, changes: Vec<Change>) -> Result<DeployFilterResult> {
        let (claimed, leftover_changes): (Vec<Change>, Vec<Change>) = changes
            .into_iter()
            .partition(|c| c.is_instance_change() && self.endpoint(c).is_some());
        let mut result = DeployFilterResult::leftover(leftover_changes);
        if claimed.is_empty() {
            return Ok(result);
        }

        let registry = registry_for_changes(&claimed, self.elements_source.as_ref()).await?;
        for change in claimed {
            let Some(endpoint) = self.endpoint(&change).cloned() else {
                continue;
            };
            let elem_id = change.elem_id().clone();
            match self.deploy_change(change, &endpoint, &registry).await {
                Ok(applied) => result.deploy_result.applied_changes.push(applied),
                Err(e) => {
                    log::warn!("Failed to deploy {}: {:#}", elem_id, e);
                    result.deploy_result.errors.push(DeployError::new(&elem_id, format!("{:#}", e)));
                }
            }
        }
        Ok(result)
    }
}
