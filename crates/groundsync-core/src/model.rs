//! # Synced Model Declarations
//!
//! A [`SyncedModel`] pairs a local table shape with the [`SyncConfig`] that
//! says where its rows come from.
//!
//! ## Declaration Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncConfig::builder()                                                  │
//! │     .datasource(Arc<dyn Datasource>)   required                         │
//! │     .external_id_field("external_id")  default                          │
//! │     .map_field("mentor", "teacher")    field_map (None = identity)      │
//! │     .sync_interval(1 day)              default, or .no_auto_sync()      │
//! │     .build()?                                                           │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  SyncedModel::builder("person")                                         │
//! │     .table("people")                   default = model name             │
//! │     .field(FieldDef::text("name").required())                           │
//! │     .field(FieldDef::reference("mentor", "person"))                     │
//! │     .sync_config(config)                                                │
//! │     .build()?                          ← local checks, fail fast        │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  ModelRegistry::register(model)?       ← cross-model checks             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Composition
//! Configs and models are composed, never inherited: `SyncConfig::extend`
//! and `SyncedModel::extend` start a builder from an existing declaration and
//! only the values set on the builder change.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::datasource::{Datasource, ListQuery};
use crate::error::{CoreError, CoreResult};
use crate::field::{FieldDef, FieldKind};
use crate::resource::{ExternalId, Resource};
use crate::validation::{validate_field_name, validate_identifier, validate_interval};

/// Default name of the external-id column.
pub const DEFAULT_EXTERNAL_ID_FIELD: &str = "external_id";

/// Default auto-sync interval (one day).
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Sync Config
// =============================================================================

/// How a synced model is fed from its datasource.
#[derive(Clone)]
pub struct SyncConfig {
    datasource: Arc<dyn Datasource>,
    external_id_field: String,
    field_map: Option<BTreeMap<String, String>>,
    sync_interval: Option<Duration>,
    list_query: ListQuery,
}

impl SyncConfig {
    /// Starts a new config with default values and no datasource.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Starts a builder pre-populated from `self`.
    pub fn extend(&self) -> SyncConfigBuilder {
        SyncConfigBuilder {
            datasource: Some(self.datasource.clone()),
            external_id_field: self.external_id_field.clone(),
            field_map: self.field_map.clone(),
            sync_interval: self.sync_interval,
            list_query: self.list_query.clone(),
        }
    }

    pub fn datasource(&self) -> &Arc<dyn Datasource> {
        &self.datasource
    }

    /// Name of the local column holding the external identity.
    pub fn external_id_field(&self) -> &str {
        &self.external_id_field
    }

    /// `None` means every local field reads the resource field of the same name.
    pub fn field_map(&self) -> Option<&BTreeMap<String, String>> {
        self.field_map.as_ref()
    }

    /// `None` means the model is never scheduled automatically.
    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval
    }

    pub fn list_query(&self) -> &ListQuery {
        &self.list_query
    }

    /// Resource field read for a local field, `None` when a field map exists
    /// and does not mention the field.
    pub fn source_key<'a>(&'a self, local_field: &'a str) -> Option<&'a str> {
        match &self.field_map {
            None => Some(local_field),
            Some(map) => map.get(local_field).map(String::as_str),
        }
    }

    /// Resource field used as the join key.
    ///
    /// The external-id field's mapping when the field map names it, otherwise
    /// the datasource's identity field.
    pub fn resource_id_field(&self) -> &str {
        self.field_map
            .as_ref()
            .and_then(|map| map.get(&self.external_id_field))
            .map(String::as_str)
            .unwrap_or_else(|| self.datasource.identity_field())
    }

    /// True when the join key is the datasource's own identity, so a bare
    /// reference can be looked up without fetching it first.
    pub fn joins_on_identity(&self) -> bool {
        self.resource_id_field() == self.datasource.identity_field()
    }

    /// Extracts the join value from a resource.
    pub fn join_value(&self, resource: &Resource) -> Option<ExternalId> {
        match self
            .field_map
            .as_ref()
            .and_then(|map| map.get(&self.external_id_field))
        {
            Some(mapped) => resource.identity(mapped),
            None => self.datasource.identity_of(resource),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("identity_field", &self.datasource.identity_field())
            .field("external_id_field", &self.external_id_field)
            .field("field_map", &self.field_map)
            .field("sync_interval", &self.sync_interval)
            .field("list_query", &self.list_query)
            .finish()
    }
}

/// Builder for [`SyncConfig`].
pub struct SyncConfigBuilder {
    datasource: Option<Arc<dyn Datasource>>,
    external_id_field: String,
    field_map: Option<BTreeMap<String, String>>,
    sync_interval: Option<Duration>,
    list_query: ListQuery,
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        SyncConfigBuilder {
            datasource: None,
            external_id_field: DEFAULT_EXTERNAL_ID_FIELD.to_string(),
            field_map: None,
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
            list_query: ListQuery::new(),
        }
    }
}

impl SyncConfigBuilder {
    pub fn datasource(mut self, datasource: Arc<dyn Datasource>) -> Self {
        self.datasource = Some(datasource);
        self
    }

    pub fn external_id_field(mut self, field: impl Into<String>) -> Self {
        self.external_id_field = field.into();
        self
    }

    /// Replaces the whole field map.
    pub fn field_map<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.field_map = Some(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Adds one `local -> remote` entry, creating the map if needed.
    pub fn map_field(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.field_map
            .get_or_insert_with(BTreeMap::new)
            .insert(local.into(), remote.into());
        self
    }

    /// Drops the field map so every field maps to itself.
    pub fn identity_mapping(mut self) -> Self {
        self.field_map = None;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Never schedule this model automatically.
    pub fn no_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    pub fn list_query(mut self, query: ListQuery) -> Self {
        self.list_query = query;
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.list_query.insert(key.into(), value.into());
        self
    }

    /// Finishes the config.
    ///
    /// ## Errors
    /// `CoreError::MissingDatasource` if no datasource was set.
    pub fn build(self) -> CoreResult<SyncConfig> {
        let datasource = self.datasource.ok_or_else(|| CoreError::MissingDatasource {
            model: "<unbound>".to_string(),
        })?;

        Ok(SyncConfig {
            datasource,
            external_id_field: self.external_id_field,
            field_map: self.field_map,
            sync_interval: self.sync_interval,
            list_query: self.list_query,
        })
    }
}

// =============================================================================
// Synced Model
// =============================================================================

/// A persisted entity type kept in sync with a resource stream.
#[derive(Debug, Clone)]
pub struct SyncedModel {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    sync_config: SyncConfig,
}

impl SyncedModel {
    pub fn builder(name: impl Into<String>) -> SyncedModelBuilder {
        SyncedModelBuilder {
            name: name.into(),
            table: None,
            fields: Vec::new(),
            sync_config: None,
            inherited: false,
        }
    }

    /// Starts a builder for a new model carrying this model's fields and config.
    pub fn extend(&self, name: impl Into<String>, table: impl Into<String>) -> SyncedModelBuilder {
        SyncedModelBuilder {
            name: name.into(),
            table: Some(table.into()),
            fields: self.fields.clone(),
            sync_config: Some(self.sync_config.clone()),
            inherited: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync_config
    }

    pub fn datasource(&self) -> &Arc<dyn Datasource> {
        self.sync_config.datasource()
    }

    /// Name of the external-id column.
    pub fn external_id_column(&self) -> &str {
        self.sync_config.external_id_field()
    }

    /// Fields stored as columns on the model table.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.kind.is_many_to_many())
    }

    pub fn many_to_many_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.kind.is_many_to_many())
    }

    /// Name of the join table backing a many-to-many field.
    pub fn join_table(&self, field: &str) -> String {
        format!("{}_{}", self.table, field)
    }

    /// Related model names, in declaration order.
    pub fn related_models(&self) -> impl Iterator<Item = (&FieldDef, &str)> {
        self.fields
            .iter()
            .filter_map(|f| f.kind.target().map(|target| (f, target)))
    }
}

/// Builder for [`SyncedModel`].
#[derive(Debug)]
pub struct SyncedModelBuilder {
    name: String,
    table: Option<String>,
    fields: Vec<FieldDef>,
    sync_config: Option<SyncConfig>,
    inherited: bool,
}

impl SyncedModelBuilder {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Adds a field, replacing an inherited field of the same name.
    pub fn field(mut self, field: FieldDef) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) if self.inherited => *existing = field,
            _ => self.fields.push(field),
        }
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        for field in fields {
            self = self.field(field);
        }
        self
    }

    /// Drops an inherited field.
    pub fn without_field(mut self, name: &str) -> Self {
        self.fields.retain(|f| f.name != name);
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = Some(config);
        self
    }

    /// Validates the declaration and builds the model.
    ///
    /// ## Errors
    /// - `MissingDatasource` without a sync config
    /// - `InvalidIdentifier` for a bad model, table or field name
    /// - `ReservedField` / `DuplicateField` for clashing field names
    /// - `UnknownMappedField` when the field map names an undeclared field
    /// - `InvalidInterval` for a zero interval
    pub fn build(self) -> CoreResult<SyncedModel> {
        let name = self.name;
        validate_identifier(&name)?;

        let table = self.table.unwrap_or_else(|| name.clone());
        validate_identifier(&table)?;

        let sync_config = self
            .sync_config
            .ok_or_else(|| CoreError::MissingDatasource {
                model: name.clone(),
            })?;
        validate_identifier(sync_config.external_id_field())?;
        validate_interval(&name, sync_config.sync_interval())?;

        let mut seen = HashSet::new();
        let mut columns = HashSet::new();
        for field in &self.fields {
            validate_field_name(&name, &field.name, sync_config.external_id_field())?;
            if !seen.insert(field.name.as_str()) {
                return Err(CoreError::DuplicateField {
                    model: name.clone(),
                    field: field.name.clone(),
                });
            }
            if let Some(column) = field.column_name() {
                if !columns.insert(column) {
                    return Err(CoreError::DuplicateField {
                        model: name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
            if let FieldKind::Reference { target } | FieldKind::ManyToMany { target } = &field.kind
            {
                validate_identifier(target)?;
            }
        }

        if let Some(map) = sync_config.field_map() {
            for local in map.keys() {
                let declared = seen.contains(local.as_str())
                    || local == sync_config.external_id_field();
                if !declared {
                    return Err(CoreError::UnknownMappedField {
                        model: name.clone(),
                        field: local.clone(),
                    });
                }
            }
        }

        Ok(SyncedModel {
            name,
            table,
            fields: self.fields,
            sync_config,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticDatasource;
    use serde_json::json;

    fn config() -> SyncConfigBuilder {
        SyncConfig::builder().datasource(Arc::new(StaticDatasource::default()))
    }

    fn person(config: SyncConfig) -> CoreResult<SyncedModel> {
        SyncedModel::builder("person")
            .field(FieldDef::text("name").required())
            .field(FieldDef::reference("mentor", "person"))
            .field(FieldDef::many_to_many("friends", "person"))
            .sync_config(config)
            .build()
    }

    #[test]
    fn test_sync_config_defaults() {
        let config = config().build().unwrap();

        assert_eq!(config.external_id_field(), "external_id");
        assert!(config.field_map().is_none());
        assert_eq!(config.sync_interval(), Some(DEFAULT_SYNC_INTERVAL));
        assert!(config.list_query().is_empty());
        assert_eq!(config.resource_id_field(), "id");
    }

    #[test]
    fn test_sync_config_requires_datasource() {
        assert!(matches!(
            SyncConfig::builder().build(),
            Err(CoreError::MissingDatasource { .. })
        ));
        assert!(matches!(
            SyncedModel::builder("person").build(),
            Err(CoreError::MissingDatasource { ref model }) if model == "person"
        ));
    }

    #[test]
    fn test_source_key_with_and_without_map() {
        let identity = config().build().unwrap();
        assert_eq!(identity.source_key("name"), Some("name"));

        let mapped = config().map_field("mentor", "teacher").build().unwrap();
        assert_eq!(mapped.source_key("mentor"), Some("teacher"));
        assert_eq!(mapped.source_key("name"), None);
    }

    #[test]
    fn test_join_value_follows_mapped_external_id() {
        let resource =
            Resource::from_value(json!({"id": "a", "person_id": 9, "name": "Alice"})).unwrap();

        let plain = config().build().unwrap();
        assert_eq!(plain.join_value(&resource), Some(ExternalId::new("a")));

        let mapped = config()
            .map_field("external_id", "person_id")
            .build()
            .unwrap();
        assert_eq!(mapped.resource_id_field(), "person_id");
        assert_eq!(mapped.join_value(&resource), Some(ExternalId::new("9")));
        assert!(plain.joins_on_identity());
        assert!(!mapped.joins_on_identity());

        let same = config().map_field("external_id", "id").build().unwrap();
        assert!(same.joins_on_identity());
    }

    #[test]
    fn test_extend_overrides_only_what_is_set() {
        let parent = config()
            .map_field("name", "full_name")
            .query_param("house", "commons")
            .build()
            .unwrap();

        let child = parent.extend().no_auto_sync().build().unwrap();

        assert_eq!(child.sync_interval(), None);
        assert_eq!(child.source_key("name"), Some("full_name"));
        assert_eq!(child.list_query().get("house").map(String::as_str), Some("commons"));
        assert_eq!(parent.sync_interval(), Some(DEFAULT_SYNC_INTERVAL));
    }

    #[test]
    fn test_model_build() {
        let model = person(config().build().unwrap()).unwrap();

        assert_eq!(model.table(), "person");
        assert_eq!(model.external_id_column(), "external_id");
        assert_eq!(model.column_fields().count(), 2);
        assert_eq!(model.many_to_many_fields().count(), 1);
        assert_eq!(model.join_table("friends"), "person_friends");
        assert!(model.field("name").unwrap().required);
    }

    #[test]
    fn test_model_rejects_reserved_and_duplicate_fields() {
        let reserved = SyncedModel::builder("person")
            .field(FieldDef::text("last_sync_time"))
            .sync_config(config().build().unwrap())
            .build();
        assert!(matches!(reserved, Err(CoreError::ReservedField { .. })));

        let duplicate = SyncedModel::builder("person")
            .fields([FieldDef::text("name"), FieldDef::integer("name")])
            .sync_config(config().build().unwrap())
            .build();
        assert!(matches!(duplicate, Err(CoreError::DuplicateField { .. })));
    }

    #[test]
    fn test_model_rejects_unknown_mapped_field() {
        let result = person(config().map_field("nickname", "nick").build().unwrap());
        assert!(matches!(
            result,
            Err(CoreError::UnknownMappedField { ref field, .. }) if field == "nickname"
        ));

        assert!(person(
            config()
                .map_field("external_id", "person_id")
                .build()
                .unwrap()
        )
        .is_ok());
    }

    #[test]
    fn test_model_rejects_zero_interval() {
        let result = person(config().sync_interval(Duration::ZERO).build().unwrap());
        assert!(matches!(result, Err(CoreError::InvalidInterval { .. })));
    }

    #[test]
    fn test_model_extend() {
        let parent = person(config().build().unwrap()).unwrap();

        let child = parent
            .extend("mp", "members")
            .field(FieldDef::text("party"))
            .field(FieldDef::text("name"))
            .without_field("friends")
            .build()
            .unwrap();

        assert_eq!(child.name(), "mp");
        assert_eq!(child.table(), "members");
        assert_eq!(child.fields().len(), 3);
        assert!(!child.field("name").unwrap().required);
        assert_eq!(child.many_to_many_fields().count(), 0);
    }
}
