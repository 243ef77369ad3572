use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::client::{FetchRequest, HttpMethod};
use crate::error::EngineError;
use crate::logic::alias::AliasData;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Adapter name, the first segment of every element id
    pub adapter: String,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub alias: AliasConfig,
    #[serde(default)]
    pub service_url: ServiceUrlConfig,
    /// Type name -> fields whose `_restriction` annotation is dropped on fetch
    #[serde(default)]
    pub restrictions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub orders: Vec<OrderRule>,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub types: BTreeMap<String, TypeFetchConfig>,
    /// Type name patterns to fetch; empty means all
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Turn unmatched reference values into missing references
    #[serde(default = "default_true")]
    pub missing_references: bool,
    /// Type name -> list fields whose duplicate entries are removed before deploy
    #[serde(default)]
    pub duplicate_list_fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeFetchConfig {
    /// Top level request; types without one are only created as standalone children
    #[serde(default)]
    pub request: Option<FetchRequest>,
    /// Response field holding the records, when they are wrapped
    #[serde(default)]
    pub data_field: Option<String>,
    /// Dotted paths used to build instance names
    #[serde(default)]
    pub id_fields: Vec<String>,
    #[serde(default = "default_service_id_field")]
    pub service_id_field: String,
    /// Prefix child names with their parent's name
    #[serde(default)]
    pub extends_parent_id: bool,
    /// Singleton type with one settings instance
    #[serde(default)]
    pub is_settings: bool,
    #[serde(default)]
    pub standalone_fields: Vec<StandaloneField>,
    #[serde(default)]
    pub field_references: Vec<FieldReferenceRule>,
}

/// Nested records extracted into their own instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandaloneField {
    pub field: String,
    pub type_name: String,
}

/// A field holding the service id of an instance of `target_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReferenceRule {
    /// Dotted path; array values reference each item
    pub field: String,
    pub target_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub types: BTreeMap<String, AliasData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceUrlConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Type name -> path template, `{field}` placeholders read instance values
    #[serde(default)]
    pub types: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_users_request")]
    pub request: FetchRequest,
    #[serde(default = "default_service_id_field")]
    pub id_field: String,
    #[serde(default = "default_login_field")]
    pub login_field: String,
    /// Query parameter carrying the search expression
    #[serde(default = "default_search_param")]
    pub search_param: String,
    /// Type name -> dotted paths of fields holding user ids
    #[serde(default)]
    pub type_fields: BTreeMap<String, Vec<String>>,
}

/// Child ordering materialized as a separate `<child_type>_order` instance per parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRule {
    pub parent_type: String,
    pub child_type: String,
    /// Child field referencing its parent
    pub child_parent_field: String,
    /// Child field holding its position
    #[serde(default = "default_position_field")]
    pub position_field: String,
    /// Field holding the ordered references, on the order instance and on the parent
    pub order_field: String,
}

impl OrderRule {
    pub fn order_type_name(&self) -> String {
        format!("{}_order", self.child_type)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnclaimedChangePolicy {
    /// A change no filter deployed is reported as an error
    #[default]
    Error,
    /// A change no filter deployed counts as applied
    SilentSuccess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Treat warnings from change validators as blocking
    #[serde(default)]
    pub fail_on_warnings: bool,
    #[serde(default)]
    pub unclaimed_changes: UnclaimedChangePolicy,
    /// Types whose removed values are sent as explicit nulls
    #[serde(default)]
    pub null_removed_values_types: Vec<String>,
    /// Top level fields never sent to the service
    #[serde(default)]
    pub ignored_fields: Vec<String>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, DeployEndpoints>,
    #[serde(default)]
    pub validators: ValidatorsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployEndpoints {
    #[serde(default)]
    pub add: Option<EndpointConfig>,
    #[serde(default)]
    pub modify: Option<EndpointConfig>,
    #[serde(default)]
    pub remove: Option<EndpointConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub method: HttpMethod,
    /// URL template, `{field}` placeholders read instance values
    pub url: String,
    /// Wrap the body in this field, e.g. `{"group": {...}}`
    #[serde(default)]
    pub body_field: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorsConfig {
    #[serde(default)]
    pub policy_types: Vec<String>,
    #[serde(default)]
    pub policy_rule_types: Vec<String>,
    /// Types whose default instance must deploy before its siblings
    #[serde(default)]
    pub default_dependency_types: Vec<String>,
    /// Child types that cannot be removed without their parent
    #[serde(default)]
    pub removal_with_parent_types: Vec<String>,
    /// Type name -> fields that must be unique, case-insensitively
    #[serde(default)]
    pub unique_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub associated_records: Vec<AssociatedRecordsRule>,
}

/// Removal is blocked while records fetched from `request` point at the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedRecordsRule {
    pub type_name: String,
    pub request: FetchRequest,
    /// Record field holding the removed instance's service id
    pub match_field: String,
    /// Record field listed in the error message
    pub display_field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_service_id_field() -> String {
    "id".to_string()
}

fn default_login_field() -> String {
    "profile.login".to_string()
}

fn default_search_param() -> String {
    "search".to_string()
}

fn default_position_field() -> String {
    "position".to_string()
}

fn default_users_request() -> FetchRequest {
    FetchRequest::new("/api/v1/users").with_pagination_field("after")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter: "service".to_string(),
            fetch: FetchConfig::default(),
            alias: AliasConfig::default(),
            service_url: ServiceUrlConfig::default(),
            restrictions: BTreeMap::new(),
            users: UsersConfig::default(),
            orders: Vec::new(),
            deploy: DeployConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            types: BTreeMap::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            missing_references: true,
            duplicate_list_fields: BTreeMap::new(),
        }
    }
}

impl Default for TypeFetchConfig {
    fn default() -> Self {
        Self {
            request: None,
            data_field: None,
            id_fields: Vec::new(),
            service_id_field: default_service_id_field(),
            extends_parent_id: false,
            is_settings: false,
            standalone_fields: Vec::new(),
            field_references: Vec::new(),
        }
    }
}

impl Default for AliasConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            types: BTreeMap::new(),
        }
    }
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request: default_users_request(),
            id_field: default_service_id_field(),
            login_field: default_login_field(),
            search_param: default_search_param(),
            type_fields: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional `elemgraph` config file
    /// and `ELEMGRAPH__*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        // Load environment variables from .env file if it exists
        dotenvy::dotenv().ok();

        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&EngineConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("elemgraph").required(false));

        // Nested keys use a double underscore, field names contain single ones
        config = config.add_source(
            config::Environment::with_prefix("ELEMGRAPH")
                .separator("__")
                .prefix_separator("__"),
        );

        let config = config.build()?;
        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        Ok(engine_config)
    }

    /// Load configuration from an explicit file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;
        Ok(engine_config)
    }

    /// Reject configurations the pipelines cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.adapter.is_empty() || self.adapter.contains('.') {
            return Err(EngineError::Config(format!("invalid adapter name '{}'", self.adapter)).into());
        }
        for (type_name, type_config) in &self.fetch.types {
            for standalone in &type_config.standalone_fields {
                if standalone.type_name == *type_name {
                    return Err(EngineError::Config(format!(
                        "standalone field '{}' of type '{}' cannot point at its own type",
                        standalone.field, type_name
                    ))
                    .into());
                }
            }
        }
        for rule in &self.orders {
            if rule.parent_type == rule.child_type {
                return Err(EngineError::Config(format!(
                    "order rule for '{}' must have distinct parent and child types",
                    rule.child_type
                ))
                .into());
            }
        }
        if let Some(base_url) = &self.service_url.base_url {
            url::Url::parse(base_url)
                .map_err(|e| EngineError::Config(format!("invalid base url '{}': {}", base_url, e)))?;
        }
        Ok(())
    }

    pub fn type_config(&self, type_name: &str) -> Option<&TypeFetchConfig> {
        self.fetch.types.get(type_name)
    }

    pub fn service_id_field(&self, type_name: &str) -> &str {
        self.type_config(type_name)
            .map(|c| c.service_id_field.as_str())
            .unwrap_or("id")
    }
}

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.fetch.missing_references);
        assert!(config.alias.enabled);
        assert_eq!(config.users.request.pagination_field.as_deref(), Some("after"));
        assert_eq!(config.deploy.unclaimed_changes, UnclaimedChangePolicy::Error);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = serde_json::json!({
            "adapter": "zendesk",
            "fetch": {
                "types": {
                    "brand": {
                        "request": {"url": "/api/v2/brands"},
                        "data_field": "brands",
                        "id_fields": ["name"]
                    }
                }
            },
            "deploy": {"unclaimed_changes": "silent_success"}
        });
        let config: EngineConfig = serde_json::from_value(json).unwrap();
        let brand = config.type_config("brand").unwrap();
        assert_eq!(brand.service_id_field, "id");
        assert_eq!(brand.request.as_ref().unwrap().url, "/api/v2/brands");
        assert_eq!(config.deploy.unclaimed_changes, UnclaimedChangePolicy::SilentSuccess);
        assert!(config.fetch.missing_references);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let mut config = EngineConfig::default();
        config.adapter = "bad.name".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.service_url.base_url = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }
}
