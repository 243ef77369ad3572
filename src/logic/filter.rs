use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::client::{DeployClient, Paginator};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{Change, DeployResult, ElemId, Element, ElementQuery, Severity, SharedContext};
use crate::store::ElementsSource;

/// Recoverable fetch problem reported to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchWarning {
    pub message: String,
    pub detailed_message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elem_id: Option<ElemId>,
}

impl FetchWarning {
    pub fn warning(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            detailed_message: message.clone(),
            message,
            severity: Severity::Warning,
            elem_id: None,
        }
    }

    pub fn for_element(elem_id: &ElemId, message: impl Into<String>) -> Self {
        Self {
            elem_id: Some(elem_id.clone()),
            ..Self::warning(message)
        }
    }
}

/// Change to the adapter configuration proposed after a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigSuggestion {
    ExcludeType { type_name: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterResult {
    pub errors: Vec<FetchWarning>,
    pub config_suggestions: Vec<ConfigSuggestion>,
}

impl FilterResult {
    pub fn with_errors(errors: Vec<FetchWarning>) -> Self {
        Self {
            errors,
            config_suggestions: Vec::new(),
        }
    }

    pub fn extend(&mut self, other: FilterResult) {
        self.errors.extend(other.errors);
        self.config_suggestions.extend(other.config_suggestions);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.config_suggestions.is_empty()
    }
}

/// Output of a filter's `deploy` hook: what it deployed, and what it left
/// for the next filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeployFilterResult {
    pub deploy_result: DeployResult,
    pub leftover_changes: Vec<Change>,
}

impl DeployFilterResult {
    pub fn leftover(changes: Vec<Change>) -> Self {
        Self {
            deploy_result: DeployResult::default(),
            leftover_changes: changes,
        }
    }
}

/// Everything a filter may need, assembled once per fetch or deploy and
/// shared by every filter in the chain.
#[derive(Clone)]
pub struct FilterOptions {
    pub config: Arc<EngineConfig>,
    pub paginator: Arc<dyn Paginator>,
    pub client: Arc<dyn DeployClient>,
    pub fetch_query: Arc<ElementQuery>,
    pub elements_source: Arc<dyn ElementsSource>,
    pub shared_context: SharedContext,
}

/// One unit of the fetch and deploy pipelines.
///
/// Hooks mutate the elements or changes they are handed in place. A filter
/// never runs concurrently over the same elements.
#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_fetch(&self, _elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
        Ok(None)
    }

    async fn pre_deploy(&self, _changes: &mut Vec<Change>) -> Result<()> {
        Ok(())
    }

    /// Deploy the changes this filter is responsible for and return the rest.
    async fn deploy(&self, changes: Vec<Change>) -> Result<DeployFilterResult> {
        Ok(DeployFilterResult::leftover(changes))
    }

    async fn on_deploy(&self, _changes: &mut Vec<Change>) -> Result<()> {
        Ok(())
    }
}

pub type FilterCreator = fn(&FilterOptions) -> Box<dyn Filter>;

fn filter_failed(filter: &dyn Filter, stage: &str, err: anyhow::Error) -> anyhow::Error {
    let message = err.to_string();
    err.context(EngineError::FilterFailed {
        filter: filter.name().to_string(),
        stage: stage.to_string(),
        message,
    })
}

/// Runs a fixed, ordered chain of filters.
pub struct FiltersRunner {
    filters: Vec<Box<dyn Filter>>,
}

impl FiltersRunner {
    pub fn new(options: &FilterOptions, creators: &[FilterCreator]) -> Self {
        Self {
            filters: creators.iter().map(|create| create(options)).collect(),
        }
    }

    pub fn from_filters(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run `on_fetch` in order. A failing filter aborts the chain.
    pub async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<FilterResult> {
        let mut result = FilterResult::default();
        for filter in &self.filters {
            log::debug!("Running onFetch of filter {}", filter.name());
            let filter_result = filter
                .on_fetch(elements)
                .await
                .map_err(|e| filter_failed(filter.as_ref(), "onFetch", e))?;
            if let Some(filter_result) = filter_result {
                result.extend(filter_result);
            }
        }
        Ok(result)
    }

    /// Run `pre_deploy` in order.
    pub async fn pre_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        for filter in &self.filters {
            log::debug!("Running preDeploy of filter {}", filter.name());
            filter
                .pre_deploy(changes)
                .await
                .map_err(|e| filter_failed(filter.as_ref(), "preDeploy", e))?;
        }
        Ok(())
    }

    /// Run `deploy` in order, each filter seeing what the previous ones left.
    pub async fn deploy(&self, changes: Vec<Change>) -> Result<DeployFilterResult> {
        let mut deploy_result = DeployResult::default();
        let mut leftover_changes = changes;
        for filter in &self.filters {
            if leftover_changes.is_empty() {
                break;
            }
            let filter_result = filter
                .deploy(leftover_changes)
                .await
                .map_err(|e| filter_failed(filter.as_ref(), "deploy", e))?;
            log::debug!(
                "Filter {} deployed {} changes with {} errors",
                filter.name(),
                filter_result.deploy_result.applied_changes.len(),
                filter_result.deploy_result.errors.len()
            );
            deploy_result.extend(filter_result.deploy_result);
            leftover_changes = filter_result.leftover_changes;
        }
        Ok(DeployFilterResult {
            deploy_result,
            leftover_changes,
        })
    }

    /// Run `on_deploy` in reverse order.
    pub async fn on_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        for filter in self.filters.iter().rev() {
            log::debug!("Running onDeploy of filter {}", filter.name());
            filter
                .on_deploy(changes)
                .await
                .map_err(|e| filter_failed(filter.as_ref(), "onDeploy", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceElement, Values, ActionName};
    use parking_lot::Mutex;

    struct RecordingFilter {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        claims: Option<ActionName>,
        fail_on_fetch: bool,
    }

    #[async_trait::async_trait]
    impl Filter for RecordingFilter {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
            self.log.lock().push(format!("{}:onFetch", self.name));
            if self.fail_on_fetch {
                anyhow::bail!("boom");
            }
            elements.push(Element::Instance(InstanceElement::new(
                self.name,
                &ElemId::type_id("test", "marker"),
                Values::new(),
            )));
            Ok(Some(FilterResult::with_errors(vec![FetchWarning::warning(self.name)])))
        }

        async fn pre_deploy(&self, _changes: &mut Vec<Change>) -> Result<()> {
            self.log.lock().push(format!("{}:preDeploy", self.name));
            Ok(())
        }

        async fn deploy(&self, changes: Vec<Change>) -> Result<DeployFilterResult> {
            self.log.lock().push(format!("{}:deploy:{}", self.name, changes.len()));
            let (claimed, leftover): (Vec<Change>, Vec<Change>) = changes
                .into_iter()
                .partition(|c| Some(c.action()) == self.claims);
            Ok(DeployFilterResult {
                deploy_result: DeployResult {
                    applied_changes: claimed,
                    errors: Vec::new(),
                },
                leftover_changes: leftover,
            })
        }

        async fn on_deploy(&self, _changes: &mut Vec<Change>) -> Result<()> {
            self.log.lock().push(format!("{}:onDeploy", self.name));
            Ok(())
        }
    }

    fn runner(log: &Arc<Mutex<Vec<String>>>, fail_second: bool) -> FiltersRunner {
        FiltersRunner::from_filters(vec![
            Box::new(RecordingFilter {
                name: "first",
                log: log.clone(),
                claims: Some(ActionName::Add),
                fail_on_fetch: false,
            }),
            Box::new(RecordingFilter {
                name: "second",
                log: log.clone(),
                claims: Some(ActionName::Remove),
                fail_on_fetch: fail_second,
            }),
            Box::new(RecordingFilter {
                name: "third",
                log: log.clone(),
                claims: None,
                fail_on_fetch: false,
            }),
        ])
    }

    #[tokio::test]
    async fn test_on_fetch_runs_in_order_and_aggregates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut elements = Vec::new();
        let result = runner(&log, false).on_fetch(&mut elements).await.unwrap();

        assert_eq!(elements.len(), 3);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(*log.lock(), vec!["first:onFetch", "second:onFetch", "third:onFetch"]);
    }

    #[tokio::test]
    async fn test_failing_filter_aborts_fetch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut elements = Vec::new();
        let err = runner(&log, true).on_fetch(&mut elements).await.unwrap_err();

        match err.downcast_ref::<EngineError>() {
            Some(EngineError::FilterFailed { filter, stage, .. }) => {
                assert_eq!(filter, "second");
                assert_eq!(stage, "onFetch");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(log.lock().len(), 2, "third filter must not run");
        println!("✓ A failing onFetch aborts the chain");
    }

    #[tokio::test]
    async fn test_deploy_hooks_order_and_leftovers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&log, false);
        let type_id = ElemId::type_id("test", "thing");
        let mut changes = vec![
            Change::addition(InstanceElement::new("a", &type_id, Values::new())),
            Change::removal(InstanceElement::new("b", &type_id, Values::new())),
            Change::modification(
                InstanceElement::new("c", &type_id, Values::new()),
                InstanceElement::new("c", &type_id, Values::new()),
            ),
        ];

        runner.pre_deploy(&mut changes).await.unwrap();
        let result = runner.deploy(changes).await.unwrap();
        let mut applied = result.deploy_result.applied_changes.clone();
        runner.on_deploy(&mut applied).await.unwrap();

        assert_eq!(applied.len(), 2);
        assert_eq!(result.leftover_changes.len(), 1);
        assert_eq!(result.leftover_changes[0].action(), ActionName::Modify);
        assert_eq!(
            *log.lock(),
            vec![
                "first:preDeploy",
                "second:preDeploy",
                "third:preDeploy",
                "first:deploy:3",
                "second:deploy:2",
                "third:deploy:1",
                "third:onDeploy",
                "second:onDeploy",
                "first:onDeploy",
            ]
        );
        println!("✓ preDeploy and deploy run in order, onDeploy in reverse");
    }
}
