use anyhow::Result;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::logic::alias::add_alias_to_elements;
use crate::logic::filter::{Filter, FilterOptions, FilterResult};
use crate::model::{Element, ElementQuery};
use crate::store::ElementsSource;

/// Sets `_alias` on fetched elements from the configured alias rules.
pub struct AliasFilter {
    config: Arc<EngineConfig>,
    fetch_query: Arc<ElementQuery>,
    elements_source: Arc<dyn ElementsSource>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(AliasFilter {
        config: options.config.clone(),
        fetch_query: options.fetch_query.clone(),
        elements_source: options.elements_source.clone(),
    })
}

#[async_trait::async_trait]
impl Filter for AliasFilter {
    fn name(&self) -> &'static str {
        "addAlias"
    }

    async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
        let alias = &self.config.alias;
        if !alias.enabled || alias.types.is_empty() {
            log::debug!("Alias derivation is disabled");
            return Ok(None);
        }
        // Only a partial fetch leaves alias targets behind in the previous elements.
        let source = self
            .fetch_query
            .is_partial()
            .then_some(self.elements_source.as_ref());
        let warnings = add_alias_to_elements(elements, &alias.types, source).await?;
        Ok((!warnings.is_empty()).then(|| FilterResult::with_errors(warnings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::options;
    use crate::logic::alias::{AliasComponent, AliasData};
    use crate::model::{values_from_json, ElemId, InstanceElement};
    use serde_json::json;

    fn brand(alias_enabled: bool) -> (Box<dyn Filter>, Vec<Element>) {
        let mut config = EngineConfig::default();
        config.alias.enabled = alias_enabled;
        config
            .alias
            .types
            .insert("brand".to_string(), AliasData::new(vec![AliasComponent::field("name")]));
        let filter = create(&options(config));
        let elements = vec![Element::Instance(InstanceElement::new(
            "main",
            &ElemId::type_id("zendesk", "brand"),
            values_from_json(json!({"name": "Main Brand"})),
        ))];
        (filter, elements)
    }

    #[tokio::test]
    async fn test_sets_alias_on_fetch() {
        let (filter, mut elements) = brand(true);
        let result = filter.on_fetch(&mut elements).await.unwrap();
        assert!(result.is_none());
        assert_eq!(elements[0].alias(), Some("Main Brand"));
    }

    #[tokio::test]
    async fn test_disabled() {
        let (filter, mut elements) = brand(false);
        filter.on_fetch(&mut elements).await.unwrap();
        assert_eq!(elements[0].alias(), None);
    }
}
