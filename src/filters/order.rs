use anyhow::{anyhow, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::{DeployClient, DeployRequest};
use crate::config::{EngineConfig, OrderRule};
use crate::filters::standard_deploy::wrap_body;
use crate::logic::filter::{DeployFilterResult, Filter, FilterOptions, FilterResult};
use crate::logic::naming::{get_value_at, render_template};
use crate::model::{
    annotations, Change, DeployError, ElemId, Element, InstanceElement, ObjectType, TypeRef, Value, Values,
};
use crate::store::ElementsSource;

/// Materializes the order of child instances as one `<child>_order`
/// instance per parent, and deploys order changes as position updates.
pub struct OrderFilter {
    config: Arc<EngineConfig>,
    client: Arc<dyn DeployClient>,
    elements_source: Arc<dyn ElementsSource>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(OrderFilter {
        config: options.config.clone(),
        client: options.client.clone(),
        elements_source: options.elements_source.clone(),
    })
}

/// Children without a numeric position go last, ties broken by name.
fn compare_children(a: &(Option<f64>, ElemId), b: &(Option<f64>, ElemId)) -> Ordering {
    let position = |p: Option<f64>| p.unwrap_or(f64::INFINITY);
    position(a.0).total_cmp(&position(b.0)).then_with(|| a.1.cmp(&b.1))
}

impl OrderFilter {
    fn rule_for_order_type(&self, type_name: &str) -> Option<&OrderRule> {
        self.config.orders.iter().find(|rule| rule.order_type_name() == type_name)
    }

    fn add_order_elements(&self, rule: &OrderRule, elements: &mut Vec<Element>) {
        let adapter = &self.config.adapter;
        let order_type_id = ElemId::type_id(adapter, rule.order_type_name());

        let mut children_by_parent: BTreeMap<ElemId, Vec<(Option<f64>, ElemId)>> = BTreeMap::new();
        for child in elements.iter().filter_map(Element::as_instance) {
            if child.type_name() != rule.child_type {
                continue;
            }
            let Some(Value::Reference(parent)) = get_value_at(&child.value, &rule.child_parent_field) else {
                continue;
            };
            let position = match get_value_at(&child.value, &rule.position_field) {
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            };
            children_by_parent
                .entry(parent.elem_id().clone())
                .or_default()
                .push((position, child.elem_id.clone()));
        }

        let mut order_instances = Vec::new();
        for parent in elements.iter_mut().filter_map(Element::as_instance_mut) {
            if parent.type_name() != rule.parent_type {
                continue;
            }
            let mut children = children_by_parent.remove(&parent.elem_id).unwrap_or_default();
            children.sort_by(compare_children);
            let refs = children.into_iter().map(|(_, id)| Value::reference(id)).collect();

            let order = InstanceElement::new(
                parent.elem_id.name(),
                &order_type_id,
                Values::from([(rule.order_field.clone(), Value::Array(refs))]),
            )
            .with_annotation(
                annotations::PARENT,
                Value::Array(vec![Value::reference(parent.elem_id.clone())]),
            );
            parent
                .value
                .insert(rule.order_field.clone(), Value::reference(order.elem_id.clone()));
            order_instances.push(Element::Instance(order));
        }

        if order_instances.is_empty() {
            return;
        }
        log::debug!("Created {} {} instances", order_instances.len(), rule.order_type_name());
        let order_type = ObjectType::new(order_type_id).with_field(
            &rule.order_field,
            TypeRef::list_of(TypeRef::Object(ElemId::type_id(adapter, &rule.child_type))),
        );
        elements.push(Element::Type(order_type));
        elements.extend(order_instances);
    }

    async fn child_values(&self, reference: &Value) -> Result<Values> {
        let reference = reference
            .as_reference()
            .ok_or_else(|| anyhow!("Order entries must be references"))?;
        if let Some(Element::Instance(child)) = reference.resolved_element() {
            return Ok(child.value.clone());
        }
        match self.elements_source.get(reference.elem_id()).await? {
            Some(Element::Instance(child)) => Ok(child.value),
            _ => Err(anyhow!("Could not find {}", reference.elem_id())),
        }
    }

    /// Send the new position of every child in the order.
    async fn deploy_order(&self, rule: &OrderRule, order: &InstanceElement) -> Result<()> {
        let endpoint = self
            .config
            .deploy
            .endpoints
            .get(&rule.child_type)
            .and_then(|e| e.modify.as_ref())
            .ok_or_else(|| anyhow!("No modify endpoint configured for {}", rule.child_type))?;
        let Some(Value::Array(entries)) = order.value.get(&rule.order_field) else {
            return Ok(());
        };
        for (position, entry) in entries.iter().enumerate() {
            let child = self.child_values(entry).await?;
            let body = serde_json::Value::Object(serde_json::Map::from_iter([(
                rule.position_field.clone(),
                serde_json::Value::from(position),
            )]));
            self.client
                .send(DeployRequest {
                    method: endpoint.method,
                    url: render_template(&endpoint.url, &child)?,
                    body: Some(wrap_body(body, endpoint.body_field.as_deref())),
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Filter for OrderFilter {
    fn name(&self) -> &'static str {
        "order"
    }

    async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
        for rule in &self.config.orders {
            self.add_order_elements(rule, elements);
        }
        Ok(None)
    }

    async fn deploy(&self, changes: Vec<Change>) -> Result<DeployFilterResult> {
        let (order_changes, leftover_changes): (Vec<Change>, Vec<Change>) = changes
            .into_iter()
            .partition(|c| self.rule_for_order_type(c.type_name()).is_some());
        let mut result = DeployFilterResult::leftover(leftover_changes);

        for change in order_changes {
            let Some(rule) = self.rule_for_order_type(change.type_name()) else {
                continue;
            };
            // Removing an order removes nothing in the service.
            let deployed = match (change.is_removal(), change.instance()) {
                (true, _) => Ok(()),
                (false, Some(order)) => self.deploy_order(rule, order).await,
                (false, None) => Err(anyhow!("Only instance changes can be deployed")),
            };
            match deployed {
                Ok(()) => result.deploy_result.applied_changes.push(change),
                Err(e) => {
                    log::warn!("Failed to deploy order {}: {:#}", change.elem_id(), e);
                    result
                        .deploy_result
                        .errors
                        .push(DeployError::new(change.elem_id(), format!("{:#}", e)));
                }
            }
        }
        Ok(result)
    }
}
