use anyhow::Result;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::logic::filter::{Filter, FilterOptions, FilterResult};
use crate::model::{annotations, Element};

/// Drops the `_restriction` annotation from configured fields of fetched
/// types, for fields whose allowed values depend on other fetched elements.
pub struct RemoveRestrictionsFilter {
    config: Arc<EngineConfig>,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(RemoveRestrictionsFilter {
        config: options.config.clone(),
    })
}

#[async_trait::async_trait]
impl Filter for RemoveRestrictionsFilter {
    fn name(&self) -> &'static str {
        "removeRestrictionAnnotations"
    }

    async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
        let restrictions = &self.config.restrictions;
        if restrictions.is_empty() {
            return Ok(None);
        }
        for object_type in elements.iter_mut().filter_map(Element::as_type_mut) {
            let Some(field_names) = restrictions.get(object_type.elem_id.type_name()) else {
                continue;
            };
            for field_name in field_names {
                let removed = object_type
                    .fields
                    .get_mut(field_name)
                    .and_then(|field| field.annotations.remove(annotations::RESTRICTION));
                if removed.is_some() {
                    log::debug!("Removed restriction of {}.{}", object_type.elem_id, field_name);
                }
            }
        }
        Ok(None)
    }
}
