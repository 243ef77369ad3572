use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::config::UnclaimedChangePolicy;
use crate::error::EngineError;
use crate::logic::deploy::dependency_changers::{
    apply_dependency_changes, DefaultInstanceDependencyChanger, DependencyChanger, ParentChildDependencyChanger,
};
use crate::logic::deploy::validators::{is_blocking, validators_from_config, ChangeValidator};
use crate::logic::filter::{DeployFilterResult, FilterCreator, FilterOptions, FiltersRunner};
use crate::logic::fix_elements::remove_duplicate_list_entries;
use crate::logic::graph::topological_sort;
use crate::model::{Change, ChangeError, ChangeId, ChangeState, DeployError, DeployResult, ElemId};

pub type GroupKeyFn = Box<dyn Fn(&Change) -> String + Send + Sync>;

/// Default grouping: one group per top level element.
pub fn top_level_group_key(change: &Change) -> String {
    change.elem_id().create_top_level_parent_id().0.full_name()
}

/// Result of one deploy operation.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub operation_id: Uuid,
    pub applied_changes: Vec<Change>,
    pub errors: Vec<DeployError>,
    /// Everything validators and fixers reported, blocking or not
    pub validation_errors: Vec<ChangeError>,
    /// Final state of each change, by position in the submitted batch
    pub states: BTreeMap<ChangeId, ChangeState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeployOutcome {
    pub fn state_of(&self, id: ChangeId) -> Option<ChangeState> {
        self.states.get(&id).copied()
    }
}

/// Validate, order and deploy a change batch through a filter chain.
pub struct DeployPipeline {
    options: FilterOptions,
    filter_creators: Vec<FilterCreator>,
    validators: Vec<Box<dyn ChangeValidator>>,
    dependency_changers: Vec<Box<dyn DependencyChanger>>,
    group_key: GroupKeyFn,
}

struct ChangeGroup {
    key: String,
    change_ids: Vec<ChangeId>,
}

fn advance(states: &mut BTreeMap<ChangeId, ChangeState>, id: ChangeId, next: ChangeState) -> Result<()> {
    let current = states.get(&id).copied().unwrap_or(ChangeState::Pending);
    states.insert(id, current.transition(next)?);
    Ok(())
}

impl DeployPipeline {
    /// Pipeline with the validators and dependency changers enabled by the configuration.
    pub fn new(options: FilterOptions, filter_creators: Vec<FilterCreator>) -> Self {
        let validators = validators_from_config(options.config.clone(), options.paginator.clone());
        let dependency_changers: Vec<Box<dyn DependencyChanger>> = vec![
            Box::new(DefaultInstanceDependencyChanger::new(
                options.config.deploy.validators.default_dependency_types.clone(),
            )),
            Box::new(ParentChildDependencyChanger),
        ];
        Self {
            options,
            filter_creators,
            validators,
            dependency_changers,
            group_key: Box::new(top_level_group_key),
        }
    }

    pub fn with_validators(mut self, validators: Vec<Box<dyn ChangeValidator>>) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_dependency_changers(mut self, dependency_changers: Vec<Box<dyn DependencyChanger>>) -> Self {
        self.dependency_changers = dependency_changers;
        self
    }

    pub fn with_group_key(mut self, group_key: impl Fn(&Change) -> String + Send + Sync + 'static) -> Self {
        self.group_key = Box::new(group_key);
        self
    }

    async fn validate(&self, changes: &[Change]) -> Result<Vec<ChangeError>> {
        let mut errors = Vec::new();
        for validator in &self.validators {
            let found = validator
                .validate(changes, Some(self.options.elements_source.as_ref()))
                .await?;
            if !found.is_empty() {
                log::info!("Validator {} reported {} problems", validator.name(), found.len());
            }
            errors.extend(found);
        }
        Ok(errors)
    }

    async fn dependencies(
        &self,
        changes: &BTreeMap<ChangeId, Change>,
    ) -> Result<BTreeMap<ChangeId, BTreeSet<ChangeId>>> {
        let mut dependencies = BTreeMap::new();
        for changer in &self.dependency_changers {
            let dependency_changes = changer.change_dependencies(changes, &dependencies).await?;
            let (valid, dangling): (Vec<_>, Vec<_>) = dependency_changes
                .into_iter()
                .partition(|d| changes.contains_key(&d.source) && changes.contains_key(&d.target));
            for dependency in dangling {
                log::debug!(
                    "Ignoring dependency {} -> {} from {} on a change outside the batch",
                    dependency.source,
                    dependency.target,
                    changer.name()
                );
            }
            apply_dependency_changes(&mut dependencies, &valid);
        }
        Ok(dependencies)
    }

    /// Group changes and order groups (and changes within them) by dependencies.
    fn order_groups(
        &self,
        changes: &BTreeMap<ChangeId, Change>,
        dependencies: &BTreeMap<ChangeId, BTreeSet<ChangeId>>,
    ) -> Result<(Vec<ChangeGroup>, BTreeMap<usize, BTreeSet<usize>>)> {
        let ids: BTreeSet<ChangeId> = changes.keys().copied().collect();
        let change_order = topological_sort(&ids, dependencies).map_err(|stuck| EngineError::CyclicDependency {
            change_ids: stuck.into_iter().collect(),
        })?;

        // Groups are numbered by the position of their first change.
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<ChangeGroup> = Vec::new();
        let mut group_of: HashMap<ChangeId, usize> = HashMap::new();
        for (id, change) in changes {
            let key = (self.group_key)(change);
            let idx = *group_index.entry(key.clone()).or_insert_with(|| {
                groups.push(ChangeGroup {
                    key,
                    change_ids: Vec::new(),
                });
                groups.len() - 1
            });
            group_of.insert(*id, idx);
        }
        for id in change_order {
            groups[group_of[&id]].change_ids.push(id);
        }

        let mut group_dependencies: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (source, targets) in dependencies {
            for target in targets {
                let (source_group, target_group) = (group_of[source], group_of[target]);
                if source_group != target_group {
                    group_dependencies.entry(source_group).or_default().insert(target_group);
                }
            }
        }
        let group_ids: BTreeSet<usize> = (0..groups.len()).collect();
        let group_order = topological_sort(&group_ids, &group_dependencies).map_err(|stuck| {
            EngineError::CyclicDependency {
                change_ids: stuck
                    .iter()
                    .flat_map(|g| groups[*g].change_ids.iter().copied())
                    .collect(),
            }
        })?;

        let mut slots: Vec<Option<ChangeGroup>> = groups.into_iter().map(Some).collect();
        let ordered = group_order.iter().filter_map(|idx| slots[*idx].take()).collect();
        let remapped: HashMap<usize, usize> = group_order.iter().enumerate().map(|(pos, idx)| (*idx, pos)).collect();
        let ordered_dependencies = group_dependencies
            .into_iter()
            .map(|(source, targets)| {
                (
                    remapped[&source],
                    targets.into_iter().map(|t| remapped[&t]).collect(),
                )
            })
            .collect();
        Ok((ordered, ordered_dependencies))
    }

    /// Run one group through the filter chain: `pre_deploy`, `deploy`, then
    /// `on_deploy` over what was applied.
    pub async fn deploy_group(&self, runner: &FiltersRunner, mut changes: Vec<Change>) -> Result<DeployFilterResult> {
        runner.pre_deploy(&mut changes).await?;
        let DeployFilterResult {
            deploy_result,
            leftover_changes,
        } = runner.deploy(changes).await?;
        let DeployResult {
            mut applied_changes,
            errors,
        } = deploy_result;
        runner.on_deploy(&mut applied_changes).await?;
        Ok(DeployFilterResult {
            deploy_result: DeployResult { applied_changes, errors },
            leftover_changes,
        })
    }

    /// Deploy a change batch. Validation errors reject individual changes;
    /// a dependency cycle aborts the whole operation.
    pub async fn deploy(&self, mut changes: Vec<Change>) -> Result<DeployOutcome> {
        let operation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = &self.options.config;
        log::info!("Deploy {} started with {} changes", operation_id, changes.len());

        let mut states: BTreeMap<ChangeId, ChangeState> =
            (0..changes.len()).map(|id| (id, ChangeState::Pending)).collect();

        let mut validation_errors = remove_duplicate_list_entries(&mut changes, &config.fetch.duplicate_list_fields);
        validation_errors.extend(self.validate(&changes).await?);
        let rejected: BTreeSet<&ElemId> = validation_errors
            .iter()
            .filter(|e| is_blocking(e.severity, config.deploy.fail_on_warnings))
            .map(|e| &e.elem_id)
            .collect();

        let mut deployable: BTreeMap<ChangeId, Change> = BTreeMap::new();
        for (id, change) in changes.iter().enumerate() {
            if rejected.contains(change.elem_id()) {
                log::warn!("Change to {} was rejected by validation", change.elem_id());
                advance(&mut states, id, ChangeState::Rejected)?;
            } else {
                advance(&mut states, id, ChangeState::Validated)?;
                deployable.insert(id, change.clone());
            }
        }

        let dependencies = self.dependencies(&deployable).await?;
        let (groups, group_dependencies) = self.order_groups(&deployable, &dependencies)?;
        for id in deployable.keys() {
            advance(&mut states, *id, ChangeState::Ordered)?;
        }

        let runner = FiltersRunner::new(&self.options, &self.filter_creators);
        let mut applied_changes = Vec::new();
        let mut errors = Vec::new();
        let mut failed_groups: BTreeSet<usize> = BTreeSet::new();

        for (group_idx, group) in groups.iter().enumerate() {
            for id in &group.change_ids {
                advance(&mut states, *id, ChangeState::Deploying)?;
            }

            let blocked_by = group_dependencies
                .get(&group_idx)
                .and_then(|targets| targets.iter().find(|t| failed_groups.contains(t)));
            if let Some(blocked_by) = blocked_by {
                let message = format!(
                    "Not deployed because it depends on {} which failed",
                    groups[*blocked_by].key
                );
                for id in &group.change_ids {
                    errors.push(DeployError::new(deployable[id].elem_id(), message.clone()));
                    advance(&mut states, *id, ChangeState::Failed)?;
                }
                failed_groups.insert(group_idx);
                continue;
            }

            let group_changes: Vec<Change> = group.change_ids.iter().map(|id| deployable[id].clone()).collect();
            let by_elem_id: HashMap<ElemId, ChangeId> = group
                .change_ids
                .iter()
                .map(|id| (deployable[id].elem_id().clone(), *id))
                .collect();

            let mut settled: HashMap<ChangeId, ChangeState> = HashMap::new();
            match self.deploy_group(&runner, group_changes).await {
                Ok(result) => {
                    for error in result.deploy_result.errors {
                        if let Some(id) = by_elem_id.get(&error.elem_id) {
                            settled.insert(*id, ChangeState::Failed);
                        }
                        log::warn!("Failed to deploy {}: {}", error.elem_id, error.message);
                        errors.push(error);
                    }
                    for change in result.deploy_result.applied_changes {
                        if let Some(id) = by_elem_id.get(change.elem_id()) {
                            settled.entry(*id).or_insert(ChangeState::Applied);
                        }
                        applied_changes.push(change);
                    }
                }
                Err(e) => {
                    log::error!("Deploy of group {} failed: {:#}", group.key, e);
                    for id in &group.change_ids {
                        errors.push(DeployError::new(deployable[id].elem_id(), e.to_string()));
                        settled.insert(*id, ChangeState::Failed);
                    }
                }
            }

            // Changes no filter reported on.
            for id in &group.change_ids {
                if settled.contains_key(id) {
                    continue;
                }
                let change = &deployable[id];
                match config.deploy.unclaimed_changes {
                    UnclaimedChangePolicy::SilentSuccess => {
                        log::debug!("No filter deployed {}, treating it as applied", change.elem_id());
                        applied_changes.push(change.clone());
                        settled.insert(*id, ChangeState::Applied);
                    }
                    UnclaimedChangePolicy::Error => {
                        errors.push(DeployError::new(
                            change.elem_id(),
                            format!("No deployment handler for {} of {}", change.action(), change.type_name()),
                        ));
                        settled.insert(*id, ChangeState::Failed);
                    }
                }
            }

            for id in &group.change_ids {
                let state = settled.get(id).copied().unwrap_or(ChangeState::Failed);
                if state == ChangeState::Failed {
                    failed_groups.insert(group_idx);
                }
                advance(&mut states, *id, state)?;
            }
        }

        let finished_at = Utc::now();
        log::info!(
            "Deploy {} finished: {} applied, {} errors, {} rejected",
            operation_id,
            applied_changes.len(),
            errors.len(),
            states.values().filter(|s| **s == ChangeState::Rejected).count()
        );
        Ok(DeployOutcome {
            operation_id,
            applied_changes,
            errors,
            validation_errors,
            states,
            started_at,
            finished_at,
        })
    }
}
