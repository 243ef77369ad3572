use anyhow::Result;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::client::{collect_all, Paginator};
use crate::config::{EngineConfig, UsersConfig};
use crate::filters::change_instances_mut;
use crate::logic::filter::{FetchWarning, Filter, FilterOptions, FilterResult};
use crate::logic::naming::{get_value_at, get_value_at_mut};
use crate::model::{Change, Element, InstanceElement, SharedContext, Value, Values};

const ALL_USERS_KEY: &str = "users.id_to_login";
const DEPLOYED_USERS_KEY: &str = "users.deployed_id_to_login";
const SEARCH_CHUNK_SIZE: usize = 50;

type UserMapping = BTreeMap<String, String>;

/// Replaces user ids with logins on fetch, and logins with ids for the
/// duration of a deploy.
pub struct UserIdsFilter {
    config: Arc<EngineConfig>,
    paginator: Arc<dyn Paginator>,
    shared_context: SharedContext,
}

pub fn create(options: &FilterOptions) -> Box<dyn Filter> {
    Box::new(UserIdsFilter {
        config: options.config.clone(),
        paginator: options.paginator.clone(),
        shared_context: options.shared_context.clone(),
    })
}

fn json_at<'v>(record: &'v serde_json::Value, dotted_path: &str) -> Option<&'v serde_json::Value> {
    record.pointer(&format!("/{}", dotted_path.replace('.', "/")))
}

fn json_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Id -> login for every user record that has both.
fn id_to_login(users: &UsersConfig, records: &[serde_json::Value]) -> UserMapping {
    records
        .iter()
        .filter_map(|record| {
            let id = json_at(record, &users.id_field).and_then(json_string)?;
            let login = json_at(record, &users.login_field).and_then(json_string)?;
            Some((id, login))
        })
        .collect()
}

/// Map the user values at `paths`, single values and lists alike. Values
/// without a mapping are kept.
fn replace_values(values: &mut Values, paths: &[String], mapping: &UserMapping) {
    for path in paths {
        let targets: Vec<&mut Value> = match get_value_at_mut(values, path) {
            Some(Value::Array(items)) => items.iter_mut().collect(),
            Some(single) => vec![single],
            None => continue,
        };
        for target in targets {
            let mapped = target
                .to_primitive_string()
                .and_then(|current| mapping.get(&current));
            if let Some(mapped) = mapped {
                *target = Value::string(mapped.clone());
            }
        }
    }
}

fn user_values(instance: &InstanceElement, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|path| get_value_at(&instance.value, path))
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().filter_map(Value::to_primitive_string).collect(),
            single => single.to_primitive_string().into_iter().collect::<Vec<_>>(),
        })
        .collect()
}

impl UserIdsFilter {
    fn users(&self) -> &UsersConfig {
        &self.config.users
    }

    fn paths_for(&self, type_name: &str) -> Option<&Vec<String>> {
        self.users().type_fields.get(type_name)
    }

    fn is_enabled(&self) -> bool {
        let enabled = self.users().enabled && !self.users().type_fields.is_empty();
        if !enabled {
            log::debug!("Converting user ids is disabled");
        }
        enabled
    }

    /// All users, fetched once per operation.
    async fn all_users(&self) -> Result<UserMapping> {
        if let Some(mapping) = self.shared_context.get_typed::<UserMapping>(ALL_USERS_KEY)? {
            return Ok(mapping);
        }
        let records = collect_all(self.paginator.as_ref(), &self.users().request).await?;
        let mapping = id_to_login(self.users(), &records);
        self.shared_context.set_typed(ALL_USERS_KEY, &mapping)?;
        Ok(mapping)
    }

    /// Users whose login is one of `logins`, searched in chunks.
    async fn users_by_login(&self, logins: &BTreeSet<String>) -> Result<UserMapping> {
        let users = self.users();
        let searches: Vec<String> = logins
            .iter()
            .chunks(SEARCH_CHUNK_SIZE)
            .into_iter()
            .map(|chunk| {
                chunk
                    .map(|login| format!("{} eq \"{}\"", users.login_field, login))
                    .join(" or ")
            })
            .collect();
        let mut mapping = UserMapping::new();
        for search in searches {
            let request = users.request.clone().with_query_param(&users.search_param, search);
            let records = collect_all(self.paginator.as_ref(), &request).await?;
            mapping.extend(id_to_login(users, &records));
        }
        Ok(mapping)
    }
}

#[async_trait::async_trait]
impl Filter for UserIdsFilter {
    fn name(&self) -> &'static str {
        "usersFilter"
    }

    async fn on_fetch(&self, elements: &mut Vec<Element>) -> Result<Option<FilterResult>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let mapping = match self.all_users().await {
            Ok(mapping) => mapping,
            Err(e) => {
                log::warn!("Failed to fetch users: {:#}", e);
                return Ok(Some(FilterResult::with_errors(vec![FetchWarning::warning(format!(
                    "Failed to fetch users, user ids were not converted: {}",
                    e
                ))])));
            }
        };
        if mapping.is_empty() {
            log::warn!("Could not find any users (onFetch)");
            return Ok(None);
        }
        for instance in elements.iter_mut().filter_map(Element::as_instance_mut) {
            if let Some(paths) = self.paths_for(instance.type_name()) {
                replace_values(&mut instance.value, paths, &mapping);
            }
        }
        Ok(None)
    }

    async fn pre_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut logins = BTreeSet::new();
        for change in changes.iter() {
            let Some(paths) = self.paths_for(change.type_name()) else {
                continue;
            };
            for element in change.before().into_iter().chain(change.after()) {
                if let Some(instance) = element.as_instance() {
                    logins.extend(user_values(instance, paths));
                }
            }
        }
        if logins.is_empty() {
            return Ok(());
        }

        let id_to_login = self.users_by_login(&logins).await?;
        if id_to_login.is_empty() {
            log::warn!("Could not find any users (preDeploy)");
            return Ok(());
        }
        self.shared_context.set_typed(DEPLOYED_USERS_KEY, &id_to_login)?;

        let login_to_id: UserMapping = id_to_login.iter().map(|(id, login)| (login.clone(), id.clone())).collect();
        for change in changes.iter_mut() {
            let Some(paths) = self.paths_for(change.type_name()) else {
                continue;
            };
            for instance in change_instances_mut(change) {
                replace_values(&mut instance.value, paths, &login_to_id);
            }
        }
        Ok(())
    }

    async fn on_deploy(&self, changes: &mut Vec<Change>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(id_to_login) = self.shared_context.get_typed::<UserMapping>(DEPLOYED_USERS_KEY)? else {
            return Ok(());
        };
        for change in changes.iter_mut() {
            let Some(paths) = self.paths_for(change.type_name()) else {
                continue;
            };
            for instance in change_instances_mut(change) {
                replace_values(&mut instance.value, paths, &id_to_login);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryPaginator, RecordingDeployClient};
    use crate::filters::test_support::options_with;
    use crate::model::{values_from_json, ElemId};
    use crate::store::InMemoryElementsSource;
    use serde_json::json;

    fn paginator() -> InMemoryPaginator {
        InMemoryPaginator::new()
            .with_pages(
                "/api/v1/users",
                vec![vec![
                    json!({"id": "00u1", "profile": {"login": "a@acme.com"}}),
                    json!({"id": "00u2", "profile": {"login": "b@acme.com"}}),
                ]],
            )
            .with_responder(|request| {
                let search = request.query_params.get("search")?;
                let users = [("00u1", "a@acme.com"), ("00u2", "b@acme.com")]
                    .into_iter()
                    .filter(|(_, login)| search.contains(&format!("profile.login eq \"{}\"", login)))
                    .map(|(id, login)| json!({"id": id, "profile": {"login": login}}))
                    .collect();
                Some(vec![users])
            })
    }

    fn filter(paginator: InMemoryPaginator) -> Box<dyn Filter> {
        let mut config = EngineConfig::default();
        config.users.enabled = true;
        config.users.type_fields = BTreeMap::from([(
            "GroupRule".to_string(),
            vec!["actions.assignUserToGroups.userIds".to_string(), "owner".to_string()],
        )]);
        create(&options_with(
            config,
            Arc::new(paginator),
            Arc::new(RecordingDeployClient::new()),
            InMemoryElementsSource::new(),
        ))
    }

    fn rule(value: serde_json::Value) -> InstanceElement {
        InstanceElement::new("rule", &ElemId::type_id("okta", "GroupRule"), values_from_json(value))
    }

    #[tokio::test]
    async fn test_ids_become_logins_on_fetch() {
        let paginator = paginator();
        let filter = filter(paginator.clone());
        let mut elements = vec![Element::Instance(rule(json!({
            "actions": {"assignUserToGroups": {"userIds": ["00u1", "00u9"]}},
            "owner": "00u2",
        })))];

        filter.on_fetch(&mut elements).await.unwrap();
        filter.on_fetch(&mut elements).await.unwrap();

        let rule = elements[0].as_instance().unwrap();
        assert_eq!(
            get_value_at(&rule.value, "actions.assignUserToGroups.userIds"),
            Some(&Value::from(json!(["a@acme.com", "00u9"])))
        );
        assert_eq!(rule.value["owner"], Value::string("b@acme.com"));
        assert_eq!(paginator.requests().len(), 1, "users are fetched once");
        println!("✓ User ids replaced by logins");
    }

    #[tokio::test]
    async fn test_deploy_round_trip() {
        let paginator = paginator();
        let filter = filter(paginator.clone());
        let before = rule(json!({"owner": "a@acme.com"}));
        let after = rule(json!({
            "actions": {"assignUserToGroups": {"userIds": ["b@acme.com"]}},
            "owner": "a@acme.com",
        }));
        let mut changes = vec![Change::modification(before, after.clone())];

        filter.pre_deploy(&mut changes).await.unwrap();
        let deployed = changes[0].instance().unwrap();
        assert_eq!(deployed.value["owner"], Value::string("00u1"));
        assert_eq!(
            get_value_at(&deployed.value, "actions.assignUserToGroups.userIds"),
            Some(&Value::from(json!(["00u2"])))
        );
        let before = changes[0].before().unwrap().as_instance().unwrap();
        assert_eq!(before.value["owner"], Value::string("00u1"));

        let search = &paginator.requests()[0].query_params["search"];
        assert_eq!(search, "profile.login eq \"a@acme.com\" or profile.login eq \"b@acme.com\"");

        filter.on_deploy(&mut changes).await.unwrap();
        assert_eq!(changes[0].instance().unwrap(), &after);
    }
}
