use anyhow::{anyhow, Result};
use std::sync::Arc;
use url::Url;

use crate::config::EngineConfig;
use crate::logic::filter::{Filter, FilterOptions, FilterResult};
use crate::logic::naming::render_template;
use crate::model::{annotations, Change, Element, InstanceElement, Value};

/// Sets `_service_url` on instances of types with a configured URL template.
pub struct ServiceUrlFilter {
    config: Arc<EngineConfig>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(ServiceUrlFilter {
        config: options.config.clone(),
    })
}

impl ServiceUrlFilter {
    fn base_url(&self) -> Result<Option<Url>> {
        let Some(base_url) = &self.config.service_url.base_url else {
            return Ok(None);
        };
        Url::parse(base_url)
            .map(Some)
            .map_err(|e| anyhow!("Invalid base url '{}': {}", base_url, e))
    }

    fn add_service_url(&self, base_url: &Url, instance: &mut InstanceElement) {
        let Some(template) = self.config.service_url.types.get(instance.type_name()) else {
            return;
        };
        let url = render_template(template, &instance.value).and_then(|path| Ok(base_url.join(&path)?));
        match url {
            Ok(url) => {
                instance
                    .annotations
                    .insert(annotations::SERVICE_URL.to_string(), Value::string(url.as_str()));
            }
            Err(e) => log::debug!("No service url for {}: {}", instance.elem_id, e),
        }
    }
}

#[async_trait::async_trait]
impl Filter for ServiceUrlFilter {
    fn name(&self) -> &'static str {
        "serviceUrl"
    }

    async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
        let Some(base_url) = self.base_url()? else {
            return Ok(None);
        };
        for instance in elements.iter_mut().filter_map(Element::as_instance_mut) {
            self.add_service_url(&base_url, instance);
        }
        Ok(None)
    }

    /// Added instances only get their service id, and so their URL, on deploy.
    async fn on_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        let Some(base_url) = self.base_url()? else {
            return Ok(());
        };
        for change in changes.iter_mut().filter(|c| c.is_addition()) {
            if let Some(instance) = change.instance_mut() {
                self.add_service_url(&base_url, instance);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::options;
    use crate::model::{values_from_json, ElemId};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn filter() -> Box<dyn Filter> {
        let mut config = EngineConfig::default();
        config.service_url.base_url = Some("https://acme.zendesk.com".to_string());
        config.service_url.types = BTreeMap::from([("brand".to_string(), "/admin/brands/{id}".to_string())]);
        create(&options(config))
    }

    fn brand(name: &str, value: serde_json::Value) -> InstanceElement {
        InstanceElement::new(name, &ElemId::type_id("zendesk", "brand"), values_from_json(value))
    }

    fn service_url(instance: &InstanceElement) -> Option<&str> {
        instance.annotations.get(annotations::SERVICE_URL).and_then(Value::as_str)
    }

    #[tokio::test]
    async fn test_on_fetch() {
        let mut elements = vec![
            Element::Instance(brand("main", json!({"id": 12}))),
            Element::Instance(brand("new", json!({"name": "no id yet"}))),
            Element::Instance(InstanceElement::new(
                "form",
                &ElemId::type_id("zendesk", "ticket_form"),
                values_from_json(json!({"id": 3})),
            )),
        ];
        filter().on_fetch(&mut elements).await.unwrap();

        let urls: Vec<Option<&str>> = elements
            .iter()
            .map(|e| service_url(e.as_instance().unwrap()))
            .collect();
        assert_eq!(urls, vec![Some("https://acme.zendesk.com/admin/brands/12"), None, None]);
    }

    #[tokio::test]
    async fn test_on_deploy_additions() {
        let mut changes = vec![Change::addition(brand("main", json!({"id": 99})))];
        filter().on_deploy(&mut changes).await.unwrap();
        assert_eq!(
            service_url(changes[0].instance().unwrap()),
            Some("https://acme.zendesk.com/admin/brands/99")
        );
    }
}
