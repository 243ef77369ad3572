use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::collect_all;
use crate::config::FieldReferenceRule;
use crate::logic::builder::ElementsBuilder;
use crate::logic::filter::{ConfigSuggestion, FetchWarning, FilterCreator, FilterOptions, FiltersRunner};
use crate::logic::references::add_references;
use crate::model::Element;
use crate::store::CachedElementsSource;

/// Output of a fetch: the element graph plus everything that went wrong
/// without aborting it.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub elements: Vec<Element>,
    pub errors: Vec<FetchWarning>,
    pub config_suggestions: Vec<ConfigSuggestion>,
    pub is_partial: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Fetch every configured type, build elements, link references and run
/// the filter chain's `on_fetch` hooks.
pub struct FetchPipeline {
    options: FilterOptions,
    filter_creators: Vec<FilterCreator>,
}

/// Records of one response, unwrapped from `data_field` when configured.
fn unwrap_records(responses: Vec<serde_json::Value>, data_field: Option<&str>) -> Vec<serde_json::Value> {
    let Some(data_field) = data_field else {
        return responses;
    };
    let mut records = Vec::new();
    for mut response in responses {
        match response.get_mut(data_field).map(serde_json::Value::take) {
            Some(serde_json::Value::Array(items)) => records.extend(items),
            Some(serde_json::Value::Null) | None => {
                log::debug!("Response has no '{}' field, skipping", data_field);
            }
            Some(record) => records.push(record),
        }
    }
    records
}

impl FetchPipeline {
    pub fn new(options: FilterOptions, filter_creators: Vec<FilterCreator>) -> Self {
        Self {
            options,
            filter_creators,
        }
    }

    pub async fn fetch(&self) -> Result<FetchResult> {
        let config = self.options.config.as_ref();
        let query = self.options.fetch_query.as_ref();
        let mut builder = ElementsBuilder::new(config);
        let mut errors = Vec::new();
        let mut config_suggestions = Vec::new();

        for (type_name, type_config) in &config.fetch.types {
            let Some(request) = &type_config.request else {
                continue;
            };
            if !query.is_type_match(type_name) {
                log::debug!("Type {} does not match the fetch query, skipping", type_name);
                continue;
            }
            match collect_all(self.options.paginator.as_ref(), request).await {
                Ok(responses) => {
                    let records = unwrap_records(responses, type_config.data_field.as_deref());
                    log::info!("Fetched {} records of type {}", records.len(), type_name);
                    builder.add_records(type_name, records);
                }
                Err(e) => {
                    log::warn!("Failed to fetch type {}: {}", type_name, e);
                    errors.push(FetchWarning::warning(format!(
                        "Failed to fetch type {}: {}",
                        type_name, e
                    )));
                    config_suggestions.push(ConfigSuggestion::ExcludeType {
                        type_name: type_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let mut elements = builder.build();

        let rules: BTreeMap<String, Vec<FieldReferenceRule>> = config
            .fetch
            .types
            .iter()
            .filter(|(_, c)| !c.field_references.is_empty())
            .map(|(name, c)| (name.clone(), c.field_references.clone()))
            .collect();
        // Partial fetches look up the same previous elements from several places.
        let options = if query.is_partial() {
            FilterOptions {
                elements_source: Arc::new(CachedElementsSource::new(self.options.elements_source.clone())),
                ..self.options.clone()
            }
        } else {
            self.options.clone()
        };
        let previous = if query.is_partial() {
            Some(options.elements_source.as_ref())
        } else {
            None
        };
        errors.extend(
            add_references(
                &config.adapter,
                &mut elements,
                &rules,
                |type_name| config.service_id_field(type_name).to_string(),
                previous,
                config.fetch.missing_references,
            )
            .await?,
        );

        let runner = FiltersRunner::new(&options, &self.filter_creators);
        let filter_result = runner.on_fetch(&mut elements).await?;
        errors.extend(filter_result.errors);
        config_suggestions.extend(filter_result.config_suggestions);

        log::info!(
            "Fetch produced {} elements with {} warnings",
            elements.len(),
            errors.len()
        );
        Ok(FetchResult {
            elements,
            errors,
            config_suggestions,
            is_partial: query.is_partial(),
            fetched_at: Utc::now(),
        })
    }
}
