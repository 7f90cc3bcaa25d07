//! # Worker Configuration
//!
//! Process settings and model declarations for the groundsync worker.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     GROUNDSYNC_DATABASE_PATH=/var/lib/groundsync/data.db               │
//! │     GROUNDSYNC_POLL_INTERVAL_SECS=30                                   │
//! │     GROUNDSYNC_CACHE_TTL_SECS=500                                      │
//! │     GROUNDSYNC_REDIS_URL=redis://127.0.0.1/                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config PATH, or the platform config dir:                         │
//! │     ~/.config/groundsync/groundsync.toml (Linux)                       │
//! │     ~/Library/Application Support/org.groundsync.groundsync/ (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "groundsync.db"
//! history_days = 30
//!
//! [cron]
//! poll_interval_secs = 30
//!
//! [cache]
//! ttl_secs = 500
//!
//! [[models]]
//! name = "person"
//! field_map = { name = "name", mentor = "teacher" }
//! sync_interval_secs = 86400
//! fields = [
//!     { name = "name", type = "text", required = true },
//!     { name = "mentor", type = "reference", target = "person" },
//! ]
//!
//! [models.datasource]
//! base_url = "https://api.example.com/"
//! path = "people/"
//! items_pointer = "/results"
//! cached = true
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use groundsync_core::{
    Datasource, FieldDef, ModelRegistry, ScalarType, SyncConfig, SyncedModel,
};
use groundsync_db::DbConfig;

use crate::cache::{CacheStore, CachedLookup, DEFAULT_CACHE_TTL};
use crate::datasource::{CachedDatasource, RestDatasource};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Local store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file, created if missing.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Sync run history older than this is deleted at startup.
    #[serde(default = "default_history_days")]
    pub history_days: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("groundsync.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_history_days() -> u32 {
    30
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
            history_days: default_history_days(),
        }
    }
}

impl DatabaseSettings {
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.path).max_connections(self.max_connections)
    }
}

// =============================================================================
// Cron Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSettings {
    /// Sleep between `run_due` calls (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for CronSettings {
    fn default() -> Self {
        CronSettings {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl CronSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Default TTL for cached datasources (seconds).
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Shared Redis cache. In-process memory cache when unset.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            ttl_secs: default_cache_ttl(),
            redis_url: None,
        }
    }
}

// =============================================================================
// Model Declarations
// =============================================================================

/// Declared field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Json,
    Reference,
    ManyToMany,
}

impl FieldType {
    fn scalar(self) -> Option<ScalarType> {
        match self {
            FieldType::Text => Some(ScalarType::Text),
            FieldType::Integer => Some(ScalarType::Integer),
            FieldType::Real => Some(ScalarType::Real),
            FieldType::Boolean => Some(ScalarType::Boolean),
            FieldType::Timestamp => Some(ScalarType::Timestamp),
            FieldType::Json => Some(ScalarType::Json),
            FieldType::Reference | FieldType::ManyToMany => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDeclaration {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub required: bool,

    /// Target model for `reference` and `many_to_many` fields.
    #[serde(default)]
    pub target: Option<String>,
}

impl FieldDeclaration {
    fn to_field_def(&self, model: &str) -> SyncResult<FieldDef> {
        let field = match (self.field_type.scalar(), &self.target) {
            (Some(ty), None) => FieldDef::scalar(&self.name, ty),
            (Some(_), Some(_)) => {
                return Err(SyncError::InvalidConfig(format!(
                    "{}.{}: only reference and many_to_many fields take a target",
                    model, self.name
                )))
            }
            (None, None) => {
                return Err(SyncError::InvalidConfig(format!(
                    "{}.{}: relation field needs a target model",
                    model, self.name
                )))
            }
            (None, Some(target)) if self.field_type == FieldType::Reference => {
                FieldDef::reference(&self.name, target)
            }
            (None, Some(target)) => FieldDef::many_to_many(&self.name, target),
        };

        Ok(if self.required { field.required() } else { field })
    }
}

/// Keeps only resources whose `field` equals `equals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    pub field: String,
    pub equals: Value,
}

/// REST datasource backing one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourceSettings {
    pub base_url: String,

    /// Resource path joined onto `base_url`.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub identity_field: Option<String>,

    /// Extra request headers (API keys and the like).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// JSON pointer to the item array inside a list response.
    #[serde(default)]
    pub items_pointer: Option<String>,

    /// JSON pointer to the record inside a detail response.
    #[serde(default)]
    pub record_pointer: Option<String>,

    /// JSON pointer to the next-page cursor. Set with `cursor_param`.
    #[serde(default)]
    pub next_cursor_pointer: Option<String>,

    #[serde(default)]
    pub cursor_param: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Memoize `get(id)` through the shared cache.
    #[serde(default)]
    pub cached: bool,

    /// Overrides `[cache] ttl_secs` for this datasource.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    #[serde(default)]
    pub filter: Option<FilterSettings>,
}

impl DatasourceSettings {
    fn build_rest(&self) -> SyncResult<RestDatasource> {
        let mut builder = RestDatasource::builder(&self.base_url);
        if let Some(path) = &self.path {
            builder = builder.path(path);
        }
        if let Some(field) = &self.identity_field {
            builder = builder.identity_field(field);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(pointer) = &self.items_pointer {
            builder = builder.items_pointer(pointer);
        }
        if let Some(pointer) = &self.record_pointer {
            builder = builder.record_pointer(pointer);
        }
        match (&self.next_cursor_pointer, &self.cursor_param) {
            (Some(pointer), Some(param)) => builder = builder.cursor(pointer, param),
            (None, None) => {}
            _ => {
                return Err(SyncError::InvalidConfig(
                    "next_cursor_pointer and cursor_param must be set together".into(),
                ))
            }
        }
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(filter) = &self.filter {
            let FilterSettings { field, equals } = filter.clone();
            builder = builder.filter(move |resource| resource.get(&field) == Some(&equals));
        }
        builder.build()
    }
}

/// One `[[models]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDeclaration {
    pub name: String,

    /// Table name. Defaults to the model name.
    #[serde(default)]
    pub table: Option<String>,

    #[serde(default)]
    pub external_id_field: Option<String>,

    #[serde(default)]
    pub fields: Vec<FieldDeclaration>,

    /// `local -> remote` names. Every field maps to itself when unset.
    #[serde(default)]
    pub field_map: Option<BTreeMap<String, String>>,

    /// Query parameters sent with every list request.
    #[serde(default)]
    pub list_query: BTreeMap<String, String>,

    /// Defaults to one day.
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,

    /// `false` leaves the model out of the cron schedule.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    pub datasource: DatasourceSettings,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub cron: CronSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub models: Vec<ModelDeclaration>,
}

impl AppConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (groundsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let explicit = config_path.is_some();
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else if explicit {
                return Err(SyncError::ConfigLoadFailed(format!(
                    "config file not found: {}",
                    path.display()
                )));
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(contents: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `GROUNDSYNC_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("GROUNDSYNC_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(secs) = lookup("GROUNDSYNC_POLL_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => self.cron.poll_interval_secs = secs,
                Err(_) => warn!(value = %secs, "Ignoring invalid GROUNDSYNC_POLL_INTERVAL_SECS"),
            }
        }

        if let Some(secs) = lookup("GROUNDSYNC_CACHE_TTL_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => self.cache.ttl_secs = secs,
                Err(_) => warn!(value = %secs, "Ignoring invalid GROUNDSYNC_CACHE_TTL_SECS"),
            }
        }

        if let Some(url) = lookup("GROUNDSYNC_REDIS_URL") {
            debug!("Overriding redis URL from environment");
            self.cache.redis_url = Some(url);
        }
    }

    /// Validates settings that do not need the model registry.
    pub fn validate(&self) -> SyncResult<()> {
        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        if self.cron.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "cron.poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "cache.ttl_secs must be greater than 0".into(),
            ));
        }

        if let Some(ref url) = self.cache.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Redis URL must start with redis:// or rediss://, got: {}",
                    url
                )));
            }
        }

        for model in &self.models {
            if model.sync_interval_secs == Some(0) {
                return Err(SyncError::InvalidConfig(format!(
                    "{}: sync_interval_secs must be greater than 0",
                    model.name
                )));
            }
            if model.datasource.cache_ttl_secs == Some(0) {
                return Err(SyncError::InvalidConfig(format!(
                    "{}: cache_ttl_secs must be greater than 0",
                    model.name
                )));
            }
            let url = &model.datasource.base_url;
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::InvalidUrl(format!(
                    "{}: datasource URL must start with http:// or https://, got: {}",
                    model.name, url
                )));
            }
        }

        Ok(())
    }

    /// Turns the `[[models]]` declarations into a checked registry.
    ///
    /// Datasources marked `cached` share `cache`, keyed by model name.
    pub fn build_registry(&self, cache: Arc<dyn CacheStore>) -> SyncResult<ModelRegistry> {
        let mut models = Vec::with_capacity(self.models.len());
        for declaration in &self.models {
            models.push(self.build_model(declaration, &cache)?);
        }

        let registry = ModelRegistry::from_models(models)?;
        info!(models = registry.len(), "Model registry built");
        Ok(registry)
    }

    fn build_model(
        &self,
        declaration: &ModelDeclaration,
        cache: &Arc<dyn CacheStore>,
    ) -> SyncResult<SyncedModel> {
        let settings = &declaration.datasource;
        let mut datasource: Arc<dyn Datasource> = Arc::new(settings.build_rest()?);
        if settings.cached {
            let ttl = Duration::from_secs(settings.cache_ttl_secs.unwrap_or(self.cache.ttl_secs));
            let lookup = CachedLookup::new(Arc::clone(cache), &declaration.name, ttl);
            datasource = Arc::new(CachedDatasource::new(datasource, lookup));
        }

        let mut sync_config = SyncConfig::builder()
            .datasource(datasource)
            .list_query(declaration.list_query.clone());
        if let Some(field) = &declaration.external_id_field {
            sync_config = sync_config.external_id_field(field);
        }
        if let Some(map) = &declaration.field_map {
            sync_config = sync_config.field_map(map.clone());
        }
        sync_config = match (declaration.auto_sync, declaration.sync_interval_secs) {
            (false, _) => sync_config.no_auto_sync(),
            (true, Some(secs)) => sync_config.sync_interval(Duration::from_secs(secs)),
            (true, None) => sync_config,
        };

        let mut builder = SyncedModel::builder(&declaration.name).sync_config(sync_config.build()?);
        if let Some(table) = &declaration.table {
            builder = builder.table(table);
        }
        for field in &declaration.fields {
            builder = builder.field(field.to_field_def(&declaration.name)?);
        }

        Ok(builder.build()?)
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "groundsync", "groundsync")
            .map(|dirs| dirs.config_dir().join("groundsync.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use groundsync_core::{FieldKind, DEFAULT_SYNC_INTERVAL};
    use std::collections::HashMap;

    const PEOPLE: &str = r#"
        [database]
        path = "/tmp/people.db"

        [cron]
        poll_interval_secs = 10

        [[models]]
        name = "person"
        table = "people"
        field_map = { name = "name", mentor = "teacher", friends = "friends" }
        fields = [
            { name = "name", type = "text", required = true },
            { name = "age", type = "integer" },
            { name = "mentor", type = "reference", target = "person" },
            { name = "friends", type = "many_to_many", target = "person" },
        ]

        [models.datasource]
        base_url = "https://api.example.com/v1/"
        path = "people/"
        identity_field = "uid"
        items_pointer = "/results"
        cached = true
        cache_ttl_secs = 60
        headers = { Authorization = "Token abc" }

        [[models]]
        name = "office"
        auto_sync = false
        fields = [{ name = "city", type = "text" }]

        [models.datasource]
        base_url = "https://api.example.com/v1/offices/"
        filter = { field = "active", equals = true }
    "#;

    fn memory() -> Arc<dyn CacheStore> {
        Arc::new(MemoryCache::new())
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cron.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.cache.ttl_secs, 500);
        assert_eq!(config.database.history_days, 30);
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_parse_models() {
        let config = AppConfig::from_toml_str(PEOPLE).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/people.db"));
        assert_eq!(config.cron.poll_interval_secs, 10);
        assert_eq!(config.models.len(), 2);

        let person = &config.models[0];
        assert_eq!(person.fields.len(), 4);
        assert_eq!(person.fields[3].field_type, FieldType::ManyToMany);
        assert!(person.auto_sync);
        assert!(person.datasource.cached);
        assert!(!config.models[1].auto_sync);
    }

    #[test]
    fn test_build_registry() {
        let config = AppConfig::from_toml_str(PEOPLE).unwrap();
        let registry = config.build_registry(memory()).unwrap();

        let person = registry.model("person").unwrap();
        assert_eq!(person.table(), "people");
        assert_eq!(person.sync_config().sync_interval(), Some(DEFAULT_SYNC_INTERVAL));
        assert_eq!(person.datasource().identity_field(), "uid");
        assert_eq!(person.sync_config().source_key("mentor"), Some("teacher"));
        assert!(person.field("name").unwrap().required);
        assert!(matches!(
            person.field("friends").unwrap().kind,
            FieldKind::ManyToMany { .. }
        ));

        let office = registry.model("office").unwrap();
        assert_eq!(office.sync_config().sync_interval(), None);
        assert_eq!(registry.scheduled().count(), 1);
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let config = AppConfig::from_toml_str(
            r#"
            [[models]]
            name = "book"
            fields = [{ name = "author", type = "reference", target = "author" }]
            datasource = { base_url = "https://api.example.com/books/" }
            "#,
        )
        .unwrap();

        let err = config.build_registry(memory()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_relation_needs_target() {
        let config = AppConfig::from_toml_str(
            r#"
            [[models]]
            name = "book"
            fields = [{ name = "author", type = "reference" }]
            datasource = { base_url = "https://api.example.com/books/" }
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.build_registry(memory()),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::from_toml_str(PEOPLE).unwrap();
        assert!(config.validate().is_ok());

        config.cache.redis_url = Some("http://cache".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));
        config.cache.redis_url = Some("redis://127.0.0.1/".to_string());
        assert!(config.validate().is_ok());

        config.models[0].sync_interval_secs = Some(0);
        assert!(config.validate().is_err());
        config.models[0].sync_interval_secs = Some(60);

        config.models[1].datasource.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GROUNDSYNC_DATABASE_PATH", "/data/sync.db"),
            ("GROUNDSYNC_POLL_INTERVAL_SECS", "5"),
            ("GROUNDSYNC_CACHE_TTL_SECS", "not-a-number"),
            ("GROUNDSYNC_REDIS_URL", "redis://cache:6379/"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/data/sync.db"));
        assert_eq!(config.cron.poll_interval_secs, 5);
        assert_eq!(config.cache.ttl_secs, 500);
        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://cache:6379/"));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let result = AppConfig::load(Some(PathBuf::from("/nonexistent/groundsync.toml")));
        assert!(matches!(result, Err(SyncError::ConfigLoadFailed(_))));
    }

    #[test]
    fn test_filter_setting_parses() {
        let config = AppConfig::from_toml_str(PEOPLE).unwrap();
        let filter = config.models[1].datasource.filter.as_ref().unwrap();
        assert_eq!(filter.field, "active");
        assert_eq!(filter.equals, Value::Bool(true));
    }
}
