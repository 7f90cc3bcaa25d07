//! # Sync Manager
//!
//! Reconciles one model's datasource listing into its local table.
//!
//! ## Pass Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       sync_model("person")                              │
//! │                                                                         │
//! │  sync_runs.start ──► datasource.list(list_query)                        │
//! │                          │                                              │
//! │                          ├── Err ──► sync_runs.finish(failed), abort     │
//! │                          ▼                                              │
//! │  for each resource ─────────────────────────────────────────────┐       │
//! │  │  TX 1                                                         │       │
//! │  │   join value ──► memo? ──► store? ──► new id                  │       │
//! │  │   register(join → id)         (before any attribute work)     │       │
//! │  │   prepare_resource_attrs                                      │       │
//! │  │     scalar ──► coerce                                         │       │
//! │  │     reference ──► resolve_by_external_id / resolve_embedded   │       │
//! │  │   save (sparse upsert)                                        │       │
//! │  │  COMMIT  (rollback evicts every id registered in the TX)      │       │
//! │  │                                                               │       │
//! │  │  TX 2                                                         │       │
//! │  │   many-to-many: resolve each element, replace the relation    │       │
//! │  │  COMMIT                                                       │       │
//! │  └───────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  sync_runs.finish(completed, counts) ──► SyncReport                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cycles
//! A row is registered in its model's [`ModelSyncState`] before its
//! references are resolved, so `A.ref = B, B.ref = A` resolves to the two
//! ids without recursing forever. Reference columns are deferred foreign
//! keys and are checked when the transaction commits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use groundsync_core::resource::json_type_name;
use groundsync_core::{
    ExternalId, FieldKind, FieldValue, ModelRegistry, Resource, SyncedModel, ValidationError,
};
use groundsync_db::{records, Database, RecordWrite, SyncRunOutcome, SyncRunStatus};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Session State
// =============================================================================

/// External identity → local row id for one model, for one session.
#[derive(Debug, Clone, Default)]
pub struct ModelSyncState {
    resolved: HashMap<ExternalId, Uuid>,
}

impl ModelSyncState {
    pub fn get(&self, external_id: &ExternalId) -> Option<Uuid> {
        self.resolved.get(external_id).copied()
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

/// A resource that could not be synced.
#[derive(Debug)]
pub struct ResourceFailure {
    /// Join value of the resource, when it had one.
    pub external_id: Option<ExternalId>,
    pub error: SyncError,
}

/// Outcome of one [`SyncManager::sync_model`] pass.
#[derive(Debug)]
pub struct SyncReport {
    pub model: String,
    pub listed: usize,
    pub synced: usize,
    pub failures: Vec<ResourceFailure>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// True when every listed resource was synced.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Sync Manager
// =============================================================================

/// One sync session.
///
/// `sync_time` is fixed when the session starts and written as
/// `last_sync_time` on every row touched by the session.
///
/// ## Example
/// ```rust,ignore
/// let mut manager = SyncManager::new(db.clone(), registry.clone());
/// let report = manager.sync_model("person").await?;
/// info!(synced = report.synced, failed = report.failed(), "done");
/// ```
pub struct SyncManager {
    db: Database,
    registry: Arc<ModelRegistry>,
    sync_time: DateTime<Utc>,
    states: HashMap<String, ModelSyncState>,

    /// Registrations made inside the open transaction.
    journal: Vec<(String, ExternalId)>,

    /// Rows whose attributes are being written further up the call stack.
    in_progress: HashSet<(String, ExternalId)>,
}

impl SyncManager {
    pub fn new(db: Database, registry: Arc<ModelRegistry>) -> Self {
        SyncManager {
            db,
            registry,
            sync_time: Utc::now(),
            states: HashMap::new(),
            journal: Vec::new(),
            in_progress: HashSet::new(),
        }
    }

    pub fn sync_time(&self) -> DateTime<Utc> {
        self.sync_time
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Resolution state of a model, if the session touched it.
    pub fn state(&self, model: &str) -> Option<&ModelSyncState> {
        self.states.get(model)
    }

    /// Runs a full pass over one model.
    ///
    /// ## Errors
    /// - `Configuration` if `model` is not registered
    /// - `Datasource` if listing fails (the pass is recorded as failed)
    /// - `Database` if the run bookkeeping cannot be written
    ///
    /// Per-resource failures do not fail the pass; they are collected in
    /// [`SyncReport::failures`].
    pub async fn sync_model(&mut self, model: &str) -> SyncResult<SyncReport> {
        let model = Arc::clone(self.registry.model(model)?);
        let config = model.sync_config();
        let started = Instant::now();

        let runs = self.db.sync_runs();
        let run = runs.start(model.name(), self.sync_time).await?;

        info!(
            model = %model.name(),
            run_id = %run.id,
            external_id_field = %config.external_id_field(),
            join_field = %config.resource_id_field(),
            "Sync pass started"
        );

        let resources = match model.datasource().list(config.list_query()).await {
            Ok(resources) => resources,
            Err(e) => {
                let error = SyncError::from(e);
                error!(model = %model.name(), error = %error, "Listing failed, pass aborted");

                let outcome = SyncRunOutcome {
                    last_error: Some(error.to_string()),
                    ..SyncRunOutcome::default()
                };
                if let Err(db_error) = runs.finish(&run.id, SyncRunStatus::Failed, &outcome).await {
                    warn!(run_id = %run.id, error = %db_error, "Failed to record aborted pass");
                }
                return Err(error);
            }
        };

        let mut report = SyncReport {
            model: model.name().to_string(),
            listed: resources.len(),
            synced: 0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        };

        for resource in &resources {
            match self.sync_resource(&model, resource).await {
                Ok(()) => report.synced += 1,
                Err(error) => {
                    let external_id = config.join_value(resource);
                    warn!(
                        model = %model.name(),
                        external_id = ?external_id.as_ref().map(ExternalId::as_str),
                        error = %error,
                        "Resource sync failed, rolled back"
                    );
                    report.failures.push(ResourceFailure { external_id, error });
                }
            }
        }

        report.duration = started.elapsed();

        let outcome = SyncRunOutcome {
            listed: report.listed as i64,
            synced: report.synced as i64,
            failed: report.failed() as i64,
            last_error: report.failures.last().map(|f| f.error.to_string()),
        };
        runs.finish(&run.id, SyncRunStatus::Completed, &outcome).await?;

        info!(
            model = %model.name(),
            listed = report.listed,
            synced = report.synced,
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "Sync pass finished"
        );

        Ok(report)
    }

    // =========================================================================
    // Per-Resource Transactions
    // =========================================================================

    async fn sync_resource(&mut self, model: &Arc<SyncedModel>, resource: &Resource) -> SyncResult<()> {
        let config = model.sync_config();
        let join = config
            .join_value(resource)
            .ok_or_else(|| ValidationError::MissingIdentity {
                model: model.name().to_string(),
                field: config.resource_id_field().to_string(),
            })?;

        debug!(model = %model.name(), external_id = %join, "Syncing resource");

        let mut tx = self.db.begin().await?;
        let result = self.write_row(&mut *tx, model, &join, resource).await;
        let local = self.settle(tx, result).await?;

        if model.many_to_many_fields().next().is_none() {
            return Ok(());
        }

        let mut tx = self.db.begin().await?;
        let result = self.apply_m2m(&mut *tx, model, local, resource).await;
        self.settle(tx, result).await
    }

    async fn write_row(
        &mut self,
        conn: &mut SqliteConnection,
        model: &Arc<SyncedModel>,
        join: &ExternalId,
        resource: &Resource,
    ) -> SyncResult<Uuid> {
        let local = match self.locate(&mut *conn, model, join).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                self.register(model.name(), join, id);
                id
            }
        };

        self.save_resource(conn, model, local, join, resource).await?;
        Ok(local)
    }

    /// Commits on success; otherwise rolls back and forgets every id
    /// registered since the transaction began.
    async fn settle<T>(&mut self, tx: Transaction<'static, Sqlite>, result: SyncResult<T>) -> SyncResult<T> {
        match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    self.journal.clear();
                    Ok(value)
                }
                Err(e) => {
                    self.evict_journal();
                    Err(e.into())
                }
            },
            Err(error) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                self.evict_journal();
                Err(error)
            }
        }
    }

    fn register(&mut self, model: &str, external_id: &ExternalId, id: Uuid) {
        self.states
            .entry(model.to_string())
            .or_default()
            .resolved
            .insert(external_id.clone(), id);
        self.journal.push((model.to_string(), external_id.clone()));
    }

    fn evict_journal(&mut self) {
        for (model, external_id) in self.journal.drain(..) {
            if let Some(state) = self.states.get_mut(&model) {
                state.resolved.remove(&external_id);
            }
        }
    }

    /// Session memo, then the store. A store hit is memoized.
    async fn locate(
        &mut self,
        conn: &mut SqliteConnection,
        model: &SyncedModel,
        external_id: &ExternalId,
    ) -> SyncResult<Option<Uuid>> {
        if let Some(id) = self.state(model.name()).and_then(|s| s.get(external_id)) {
            return Ok(Some(id));
        }

        match records::find_id(conn, model, external_id).await? {
            Some(id) => {
                self.register(model.name(), external_id, id);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // Attribute Mapping
    // =========================================================================

    /// Maps and saves one resource onto the row `local`.
    ///
    /// A row already being written higher up the stack (an embedded copy of
    /// an ancestor) is left to that outer write.
    async fn save_resource(
        &mut self,
        conn: &mut SqliteConnection,
        model: &SyncedModel,
        local: Uuid,
        join: &ExternalId,
        resource: &Resource,
    ) -> SyncResult<()> {
        let key = (model.name().to_string(), join.clone());
        if !self.in_progress.insert(key.clone()) {
            debug!(model = %model.name(), external_id = %join, "Row already being written");
            return Ok(());
        }

        let result = self.write_record(conn, model, local, join, resource).await;
        self.in_progress.remove(&key);
        result
    }

    async fn write_record(
        &mut self,
        conn: &mut SqliteConnection,
        model: &SyncedModel,
        local: Uuid,
        join: &ExternalId,
        resource: &Resource,
    ) -> SyncResult<()> {
        let values = self.prepare_resource_attrs(&mut *conn, model, resource).await?;

        if !records::exists(&mut *conn, model, local).await? {
            if let Some(missing) = model
                .column_fields()
                .find(|f| f.required && !values.contains_key(&f.name))
            {
                return Err(ValidationError::Required {
                    field: missing.name.clone(),
                }
                .into());
            }
        }

        records::save(
            conn,
            model,
            &RecordWrite {
                id: local,
                external_id: join,
                sync_time: self.sync_time,
                values: &values,
            },
        )
        .await?;
        Ok(())
    }

    /// Typed column values for the fields the resource carries.
    ///
    /// Unmapped fields and absent or null values are left out, so saving
    /// the result never overwrites a column the resource says nothing about.
    fn prepare_resource_attrs<'a>(
        &'a mut self,
        conn: &'a mut SqliteConnection,
        model: &'a SyncedModel,
        resource: &'a Resource,
    ) -> BoxFuture<'a, SyncResult<BTreeMap<String, FieldValue>>> {
        Box::pin(async move {
            let config = model.sync_config();
            let mut values = BTreeMap::new();

            for field in model.column_fields() {
                let Some(key) = config.source_key(&field.name) else {
                    continue;
                };
                let Some(raw) = resource.value(key) else {
                    continue;
                };

                let value = match &field.kind {
                    FieldKind::Scalar(ty) => ty.coerce(&field.name, raw)?,
                    FieldKind::Reference { target } => {
                        let target = Arc::clone(self.registry.model(target)?);
                        let id = self
                            .resolve_reference(&mut *conn, &target, &field.name, raw)
                            .await?;
                        FieldValue::Reference(id)
                    }
                    FieldKind::ManyToMany { .. } => continue,
                };
                values.insert(field.name.clone(), value);
            }

            Ok::<_, SyncError>(values)
        })
    }

    // =========================================================================
    // Reference Resolution
    // =========================================================================

    async fn resolve_reference(
        &mut self,
        conn: &mut SqliteConnection,
        target: &Arc<SyncedModel>,
        field: &str,
        raw: &Value,
    ) -> SyncResult<Uuid> {
        if let Some(external_id) = ExternalId::from_value(raw) {
            return self.resolve_by_external_id(conn, target, &external_id).await;
        }

        match raw {
            Value::Object(_) => self.resolve_embedded_value(conn, target, raw.clone()).await,
            other => Err(ValidationError::TypeMismatch {
                field: field.to_string(),
                expected: "identifier or object".to_string(),
                found: json_type_name(other).to_string(),
            }
            .into()),
        }
    }

    /// Local id for the datasource identity `external_id`, fetching and
    /// saving the resource when neither the session nor the store knows it.
    ///
    /// When the join key is a mapped field rather than the identity, the
    /// row can only be located after fetching the resource.
    pub(crate) async fn resolve_by_external_id(
        &mut self,
        conn: &mut SqliteConnection,
        model: &Arc<SyncedModel>,
        external_id: &ExternalId,
    ) -> SyncResult<Uuid> {
        if !model.sync_config().joins_on_identity() {
            debug!(model = %model.name(), external_id = %external_id, "Fetching referenced resource");
            let resource = model.datasource().get(external_id).await?;
            return self.resolve_resource(conn, model, &resource).await;
        }

        if let Some(id) = self.locate(&mut *conn, model, external_id).await? {
            return Ok(id);
        }

        let id = Uuid::new_v4();
        self.register(model.name(), external_id, id);

        debug!(model = %model.name(), external_id = %external_id, "Fetching referenced resource");
        let resource = model.datasource().get(external_id).await?;

        self.save_resource(conn, model, id, external_id, &resource).await?;
        Ok(id)
    }

    /// Local id for an embedded resource, saved from the embedded data.
    ///
    /// The datasource is never called.
    pub(crate) async fn resolve_embedded_value(
        &mut self,
        conn: &mut SqliteConnection,
        model: &Arc<SyncedModel>,
        value: Value,
    ) -> SyncResult<Uuid> {
        let resource = Resource::from_value(value)?;
        self.resolve_resource(conn, model, &resource).await
    }

    /// Saves a resource already in hand onto the row its join key selects.
    async fn resolve_resource(
        &mut self,
        conn: &mut SqliteConnection,
        model: &Arc<SyncedModel>,
        resource: &Resource,
    ) -> SyncResult<Uuid> {
        let config = model.sync_config();
        let join = config
            .join_value(resource)
            .ok_or_else(|| ValidationError::MissingIdentity {
                model: model.name().to_string(),
                field: config.resource_id_field().to_string(),
            })?;

        let id = match self.locate(&mut *conn, model, &join).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                self.register(model.name(), &join, id);
                id
            }
        };

        debug!(model = %model.name(), external_id = %join, "Saving referenced resource");
        self.save_resource(conn, model, id, &join, resource).await?;
        Ok(id)
    }

    // =========================================================================
    // Many-to-Many
    // =========================================================================

    /// Local ids for one many-to-many field.
    ///
    /// `None` leaves the relation untouched (unmapped field); absent or null
    /// clears it.
    async fn prepare_m2m_field(
        &mut self,
        conn: &mut SqliteConnection,
        model: &SyncedModel,
        field: &str,
        target: &Arc<SyncedModel>,
        resource: &Resource,
    ) -> SyncResult<Option<Vec<Uuid>>> {
        let Some(key) = model.sync_config().source_key(field) else {
            return Ok(None);
        };

        match resource.value(key) {
            None => Ok(Some(Vec::new())),
            Some(Value::Array(items)) => {
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    ids.push(self.resolve_reference(&mut *conn, target, field, item).await?);
                }
                Ok(Some(ids))
            }
            Some(other) => Err(ValidationError::TypeMismatch {
                field: field.to_string(),
                expected: "array".to_string(),
                found: json_type_name(other).to_string(),
            }
            .into()),
        }
    }

    async fn apply_m2m(
        &mut self,
        conn: &mut SqliteConnection,
        model: &Arc<SyncedModel>,
        local: Uuid,
        resource: &Resource,
    ) -> SyncResult<()> {
        for field in model.many_to_many_fields() {
            let Some(target) = field.kind.target() else {
                continue;
            };
            let target = Arc::clone(self.registry.model(target)?);

            let Some(ids) = self
                .prepare_m2m_field(&mut *conn, model, &field.name, &target, resource)
                .await?
            else {
                continue;
            };

            records::replace_related(&mut *conn, model, &field.name, local, &ids).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("sync_time", &self.sync_time)
            .field("models", &self.states.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockDatasource;
    use groundsync_core::{DatasourceError, FieldDef, SyncConfig};
    use groundsync_db::{DbConfig, StoredRecord};
    use serde_json::json;

    fn mock(values: Vec<Value>) -> Arc<MockDatasource> {
        Arc::new(MockDatasource::from_values(values).unwrap())
    }

    fn resources(values: Vec<Value>) -> Vec<Resource> {
        values.into_iter().map(|v| Resource::from_value(v).unwrap()).collect()
    }

    /// `person { name, age, mentor -> person, friends <-> person }` with
    /// `mentor` read from `teacher` and `age` left unmapped.
    fn person(source: Arc<MockDatasource>) -> SyncedModel {
        let config = SyncConfig::builder()
            .datasource(source)
            .map_field("name", "name")
            .map_field("mentor", "teacher")
            .map_field("friends", "friends")
            .build()
            .unwrap();

        SyncedModel::builder("person")
            .field(FieldDef::text("name"))
            .field(FieldDef::integer("age"))
            .field(FieldDef::reference("mentor", "person"))
            .field(FieldDef::many_to_many("friends", "person"))
            .sync_config(config)
            .build()
            .unwrap()
    }

    /// `member { name (required), age }` with identity mapping.
    fn member(source: Arc<MockDatasource>) -> SyncedModel {
        let config = SyncConfig::builder().datasource(source).build().unwrap();
        SyncedModel::builder("member")
            .field(FieldDef::text("name").required())
            .field(FieldDef::integer("age"))
            .sync_config(config)
            .build()
            .unwrap()
    }

    async fn setup(models: Vec<SyncedModel>) -> (Database, Arc<ModelRegistry>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let registry = ModelRegistry::from_models(models).unwrap();
        db.ensure_schema(&registry).await.unwrap();
        (db, Arc::new(registry))
    }

    async fn record(db: &Database, registry: &ModelRegistry, model: &str, ext: &str) -> Option<StoredRecord> {
        db.records(registry.model(model).unwrap().clone())
            .get_by_external_id(&ExternalId::new(ext))
            .await
            .unwrap()
    }

    async fn count(db: &Database, registry: &ModelRegistry, model: &str) -> i64 {
        db.records(registry.model(model).unwrap().clone())
            .count()
            .await
            .unwrap()
    }

    fn person_data() -> Vec<Value> {
        vec![
            json!({"id": "a", "name": "Alice", "age": 56, "teacher": "b", "friends": ["b", "c"]}),
            json!({"id": "b", "name": "Bob", "teacher": "a", "friends": ["a"]}),
            json!({"id": "c", "name": "Carl", "teacher": "a", "friends": ["a"]}),
        ]
    }

    #[tokio::test]
    async fn test_person_scenario() {
        let source = mock(person_data());
        let (db, registry) = setup(vec![person(source.clone())]).await;

        let mut manager = SyncManager::new(db.clone(), registry.clone());
        let report = manager.sync_model("person").await.unwrap();

        assert_eq!(report.listed, 3);
        assert_eq!(report.synced, 3);
        assert!(report.is_clean());
        assert_eq!(count(&db, &registry, "person").await, 3);

        let alice = record(&db, &registry, "person", "a").await.unwrap();
        let bob = record(&db, &registry, "person", "b").await.unwrap();
        let carl = record(&db, &registry, "person", "c").await.unwrap();

        assert_eq!(alice.text("name"), Some("Alice"));
        assert_eq!(alice.reference("mentor"), Some(bob.id));
        assert_eq!(bob.reference("mentor"), Some(alice.id));
        assert_eq!(carl.reference("mentor"), Some(alice.id));
        assert!((alice.last_sync_time - manager.sync_time()).num_milliseconds().abs() < 1);

        let mut expected = vec![bob.id, carl.id];
        expected.sort();
        let people = db.records(registry.model("person").unwrap().clone());
        assert_eq!(people.related("friends", alice.id).await.unwrap(), expected);
        assert_eq!(people.related("friends", bob.id).await.unwrap(), vec![alice.id]);

        assert_eq!(manager.state("person").unwrap().get(&ExternalId::new("c")), Some(carl.id));
    }

    #[tokio::test]
    async fn test_unmapped_fields_are_never_populated() {
        let source = mock(person_data());
        let (db, registry) = setup(vec![person(source)]).await;

        SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();

        let alice = record(&db, &registry, "person", "a").await.unwrap();
        assert_eq!(alice.get("age"), None);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let source = mock(person_data());
        let (db, registry) = setup(vec![person(source)]).await;
        let people = db.records(registry.model("person").unwrap().clone());

        let snapshot = |records: Vec<StoredRecord>| {
            records
                .into_iter()
                .map(|r| (r.id, r.external_id, r.values))
                .collect::<Vec<_>>()
        };

        SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();
        let first = snapshot(people.all().await.unwrap());

        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();
        let second = snapshot(people.all().await.unwrap());

        assert_eq!(report.synced, 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_absent_or_null_keeps_stored_value() {
        let source = mock(vec![json!({"id": "a", "name": "Alice", "age": 56})]);
        let (db, registry) = setup(vec![member(source.clone())]).await;

        SyncManager::new(db.clone(), registry.clone())
            .sync_model("member")
            .await
            .unwrap();

        source
            .set_resources(resources(vec![json!({"id": "a", "name": null, "age": 57})]))
            .await;
        SyncManager::new(db.clone(), registry.clone())
            .sync_model("member")
            .await
            .unwrap();

        source
            .set_resources(resources(vec![json!({"id": "a"})]))
            .await;
        SyncManager::new(db.clone(), registry.clone())
            .sync_model("member")
            .await
            .unwrap();

        let alice = record(&db, &registry, "member", "a").await.unwrap();
        assert_eq!(alice.text("name"), Some("Alice"));
        assert_eq!(alice.get("age"), Some(&FieldValue::Integer(57)));
        assert_eq!(count(&db, &registry, "member").await, 1);
    }

    #[tokio::test]
    async fn test_mutual_references_make_two_rows() {
        let source = mock(vec![
            json!({"id": "a", "teacher": "b"}),
            json!({"id": "b", "teacher": "a"}),
        ]);
        let (db, registry) = setup(vec![person(source.clone())]).await;

        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(count(&db, &registry, "person").await, 2);
        let a = record(&db, &registry, "person", "a").await.unwrap();
        let b = record(&db, &registry, "person", "b").await.unwrap();
        assert_eq!(a.reference("mentor"), Some(b.id));
        assert_eq!(b.reference("mentor"), Some(a.id));

        // b was fetched once while resolving a, then found in the session.
        assert_eq!(source.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_mutually_embedded_resources_terminate() {
        let source = mock(vec![json!({
            "id": "a",
            "name": "Alice",
            "teacher": {"id": "b", "name": "Bob", "teacher": {"id": "a", "name": "Alice"}}
        })]);
        let (db, registry) = setup(vec![person(source.clone())]).await;

        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();

        assert!(report.is_clean());
        let a = record(&db, &registry, "person", "a").await.unwrap();
        let b = record(&db, &registry, "person", "b").await.unwrap();
        assert_eq!(b.text("name"), Some("Bob"));
        assert_eq!(a.reference("mentor"), Some(b.id));
        assert_eq!(b.reference("mentor"), Some(a.id));
        assert_eq!(source.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_many_to_many_is_replaced() {
        let source = mock(vec![
            json!({"id": "x"}),
            json!({"id": "y"}),
            json!({"id": "a", "friends": ["x", "y", "x"]}),
        ]);
        let (db, registry) = setup(vec![person(source.clone())]).await;
        let people = db.records(registry.model("person").unwrap().clone());

        SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();
        let a = record(&db, &registry, "person", "a").await.unwrap();
        let x = record(&db, &registry, "person", "x").await.unwrap();
        assert_eq!(people.related("friends", a.id).await.unwrap().len(), 2);

        source
            .set_resources(resources(vec![json!({"id": "a", "friends": ["x"]})]))
            .await;
        SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();
        assert_eq!(people.related("friends", a.id).await.unwrap(), vec![x.id]);

        source
            .set_resources(resources(vec![json!({"id": "a", "friends": null})]))
            .await;
        SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();
        assert!(people.related("friends", a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_many_to_many_is_untouched() {
        let source = mock(vec![
            json!({"id": "x"}),
            json!({"id": "a", "friends": ["x"]}),
        ]);
        let (db, registry) = setup(vec![person(source.clone())]).await;
        SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();

        let narrowed = person(source.clone());
        let config = narrowed
            .sync_config()
            .extend()
            .field_map([("name", "name")])
            .build()
            .unwrap();
        let narrowed = narrowed
            .extend("person", "person")
            .sync_config(config)
            .build()
            .unwrap();
        let narrowed_registry = Arc::new(ModelRegistry::from_models([narrowed]).unwrap());

        source
            .set_resources(resources(vec![json!({"id": "a", "friends": []})]))
            .await;
        SyncManager::new(db.clone(), narrowed_registry)
            .sync_model("person")
            .await
            .unwrap();

        let a = record(&db, &registry, "person", "a").await.unwrap();
        let people = db.records(registry.model("person").unwrap().clone());
        assert_eq!(people.related("friends", a.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_embedded_many_to_many_elements() {
        let source = mock(vec![
            json!({"id": "a", "name": "Alice"}),
            json!({"id": "b", "name": "Bob", "friends": [{"id": "x", "name": "Xena"}, "a"]}),
        ]);
        let (db, registry) = setup(vec![person(source.clone())]).await;

        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();

        assert!(report.is_clean());
        let a = record(&db, &registry, "person", "a").await.unwrap();
        let b = record(&db, &registry, "person", "b").await.unwrap();
        let x = record(&db, &registry, "person", "x").await.unwrap();
        assert_eq!(x.text("name"), Some("Xena"));

        let mut expected = vec![a.id, x.id];
        expected.sort();
        let people = db.records(registry.model("person").unwrap().clone());
        assert_eq!(people.related("friends", b.id).await.unwrap(), expected);
        assert_eq!(source.get_calls(), 0);
    }

    /// `person` joined on `code` instead of the datasource identity `id`.
    fn coded_person(source: Arc<MockDatasource>) -> SyncedModel {
        let config = SyncConfig::builder()
            .datasource(source)
            .map_field("external_id", "code")
            .map_field("name", "name")
            .map_field("mentor", "teacher")
            .build()
            .unwrap();

        SyncedModel::builder("person")
            .field(FieldDef::text("name"))
            .field(FieldDef::reference("mentor", "person"))
            .sync_config(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mapped_external_id_joins_every_reference() {
        let source = mock(vec![
            json!({"id": "a", "code": "A1", "name": "Alice",
                   "teacher": {"id": "b", "code": "B1", "name": "Bob"}}),
            json!({"id": "b", "code": "B1", "name": "Bob"}),
            json!({"id": "c", "code": "C1", "name": "Carl", "teacher": "b"}),
        ]);
        let (db, registry) = setup(vec![coded_person(source.clone())]).await;

        for _ in 0..2 {
            let report = SyncManager::new(db.clone(), registry.clone())
                .sync_model("person")
                .await
                .unwrap();
            assert!(report.is_clean());
            assert_eq!(report.synced, 3);
        }

        assert_eq!(count(&db, &registry, "person").await, 3);
        assert!(record(&db, &registry, "person", "b").await.is_none());

        let alice = record(&db, &registry, "person", "A1").await.unwrap();
        let bob = record(&db, &registry, "person", "B1").await.unwrap();
        let carl = record(&db, &registry, "person", "C1").await.unwrap();
        assert_eq!(bob.text("name"), Some("Bob"));
        assert_eq!(alice.reference("mentor"), Some(bob.id));
        assert_eq!(carl.reference("mentor"), Some(bob.id));
    }

    #[tokio::test]
    async fn test_mapped_external_id_mutual_references_terminate() {
        let source = mock(vec![
            json!({"id": "a", "code": "A1", "teacher": "b"}),
            json!({"id": "b", "code": "B1", "teacher": "a"}),
        ]);
        let (db, registry) = setup(vec![coded_person(source.clone())]).await;

        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(count(&db, &registry, "person").await, 2);
        let a = record(&db, &registry, "person", "A1").await.unwrap();
        let b = record(&db, &registry, "person", "B1").await.unwrap();
        assert_eq!(a.reference("mentor"), Some(b.id));
        assert_eq!(b.reference("mentor"), Some(a.id));
    }

    #[tokio::test]
    async fn test_embedded_resources_skip_the_datasource() {
        let authors = mock(Vec::new());
        let author = SyncedModel::builder("author")
            .field(FieldDef::text("name"))
            .sync_config(SyncConfig::builder().datasource(authors.clone()).build().unwrap())
            .build()
            .unwrap();
        let book = SyncedModel::builder("book")
            .field(FieldDef::text("title"))
            .field(FieldDef::reference("author", "author"))
            .sync_config(
                SyncConfig::builder()
                    .datasource(mock(vec![
                        json!({"id": 1, "title": "T", "author": {"id": "x", "name": "Xavier"}}),
                        json!({"id": 2, "title": "U", "author": {"id": "x", "name": "Xavier K."}}),
                    ]))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let (db, registry) = setup(vec![author, book]).await;

        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("book")
            .await
            .unwrap();

        assert_eq!(report.synced, 2);
        assert_eq!(authors.get_calls(), 0);
        assert_eq!(count(&db, &registry, "author").await, 1);

        let xavier = record(&db, &registry, "author", "x").await.unwrap();
        assert_eq!(xavier.text("name"), Some("Xavier K."));
        let first = record(&db, &registry, "book", "1").await.unwrap();
        assert_eq!(first.reference("author"), Some(xavier.id));
    }

    #[tokio::test]
    async fn test_invalid_resource_is_isolated() {
        let source = mock(vec![
            json!({"id": "a", "name": "Alice", "age": 1}),
            json!({"id": "b", "name": "Bob", "age": "old"}),
            json!({"id": "c", "age": 3}),
            json!({"name": "Nobody"}),
            json!({"id": "d", "name": "Dan"}),
        ]);
        let (db, registry) = setup(vec![member(source)]).await;

        let mut manager = SyncManager::new(db.clone(), registry.clone());
        let report = manager.sync_model("member").await.unwrap();

        assert_eq!(report.listed, 5);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed(), 3);
        assert!(matches!(
            report.failures[0].error,
            SyncError::Validation(ValidationError::TypeMismatch { .. })
        ));
        assert!(matches!(
            report.failures[1].error,
            SyncError::Validation(ValidationError::Required { .. })
        ));
        assert!(matches!(
            report.failures[2].error,
            SyncError::Validation(ValidationError::MissingIdentity { .. })
        ));
        assert_eq!(report.failures[0].external_id, Some(ExternalId::new("b")));
        assert_eq!(report.failures[2].external_id, None);

        assert_eq!(count(&db, &registry, "member").await, 2);
        assert!(record(&db, &registry, "member", "b").await.is_none());

        let state = manager.state("member").unwrap();
        assert!(state.get(&ExternalId::new("b")).is_none());
        assert!(state.get(&ExternalId::new("c")).is_none());
        assert!(state.get(&ExternalId::new("d")).is_some());
    }

    #[tokio::test]
    async fn test_required_applies_to_new_rows_only() {
        let source = mock(vec![json!({"id": "a", "name": "Alice"})]);
        let (db, registry) = setup(vec![member(source.clone())]).await;

        SyncManager::new(db.clone(), registry.clone())
            .sync_model("member")
            .await
            .unwrap();

        source
            .set_resources(resources(vec![json!({"id": "a", "age": 3})]))
            .await;
        let report = SyncManager::new(db.clone(), registry.clone())
            .sync_model("member")
            .await
            .unwrap();

        assert!(report.is_clean());
        let alice = record(&db, &registry, "member", "a").await.unwrap();
        assert_eq!(alice.get("age"), Some(&FieldValue::Integer(3)));
    }

    #[tokio::test]
    async fn test_missing_reference_rolls_back_resource() {
        let source = mock(vec![
            json!({"id": "a", "name": "Alice"}),
            json!({"id": "b", "name": "Bob", "teacher": "zz"}),
        ]);
        let (db, registry) = setup(vec![person(source)]).await;

        let mut manager = SyncManager::new(db.clone(), registry.clone());
        let report = manager.sync_model("person").await.unwrap();

        assert_eq!(report.synced, 1);
        assert!(matches!(
            report.failures[0].error,
            SyncError::Datasource(DatasourceError::NotFound { .. })
        ));
        assert_eq!(count(&db, &registry, "person").await, 1);

        let state = manager.state("person").unwrap();
        assert!(state.get(&ExternalId::new("b")).is_none());
        assert!(state.get(&ExternalId::new("zz")).is_none());
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn test_list_failure_aborts_pass() {
        let source = mock(person_data());
        source.fail_list(true);
        let (db, registry) = setup(vec![person(source)]).await;

        let result = SyncManager::new(db.clone(), registry.clone())
            .sync_model("person")
            .await;

        let error = result.unwrap_err();
        assert!(matches!(
            error,
            SyncError::Datasource(DatasourceError::Transport { .. })
        ));
        assert!(error.is_retryable());
        assert_eq!(count(&db, &registry, "person").await, 0);

        let run = db.sync_runs().last("person").await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert!(run.last_error.is_some());
    }

    #[tokio::test]
    async fn test_pass_is_recorded() {
        let source = mock(vec![
            json!({"id": "a", "name": "Alice"}),
            json!({"id": "b", "age": "x"}),
        ]);
        let (db, registry) = setup(vec![member(source)]).await;

        SyncManager::new(db.clone(), registry.clone())
            .sync_model("member")
            .await
            .unwrap();

        let run = db.sync_runs().last("member").await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!((run.listed, run.synced, run.failed), (2, 1, 1));
        assert!(run.last_error.unwrap().contains("age"));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let (db, registry) = setup(vec![member(mock(Vec::new()))]).await;
        let result = SyncManager::new(db, registry).sync_model("office").await;
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }
}
