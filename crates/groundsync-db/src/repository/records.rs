//! # Record Repository
//!
//! Reads and writes rows of declared models.
//!
//! ## Two Entry Points
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Free functions over &mut SqliteConnection     used by the sync engine  │
//! │  ├── find_id / exists(model, ...)              inside its transactions  │
//! │  ├── save(model, RecordWrite)       sparse upsert                       │
//! │  ├── replace_related(model, field, source, targets)                     │
//! │  ├── related_ids(model, field, source)                                  │
//! │  └── load / load_by_external_id / count                                 │
//! │                                                                         │
//! │  RecordRepository (pool)                       read side for callers    │
//! │  └── get / get_by_external_id / all / count / related                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sparse Upsert
//! `save` only writes the columns present in `RecordWrite::values`. A column
//! missing from the write keeps whatever the row already holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use groundsync_core::validation::{ID_COLUMN, LAST_SYNC_TIME_COLUMN};
use groundsync_core::{ExternalId, FieldDef, FieldKind, FieldValue, ScalarType, SyncedModel};

use crate::error::{DbError, DbResult};
use crate::schema::{quote_ident, SOURCE_COLUMN, TARGET_COLUMN};

// =============================================================================
// Record Types
// =============================================================================

/// One row write produced by a sync pass.
#[derive(Debug, Clone)]
pub struct RecordWrite<'a> {
    pub id: Uuid,
    pub external_id: &'a ExternalId,
    pub sync_time: DateTime<Utc>,

    /// Field name → value. Only these columns are written.
    pub values: &'a BTreeMap<String, FieldValue>,
}

/// One row read back from a model table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: Uuid,
    pub external_id: String,
    pub last_sync_time: DateTime<Utc>,

    /// Field name → value for every column field; NULL columns are `Null`.
    pub values: BTreeMap<String, FieldValue>,
}

impl StoredRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field).filter(|v| !v.is_null())
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn reference(&self, field: &str) -> Option<Uuid> {
        self.get(field).and_then(FieldValue::as_reference)
    }
}

// =============================================================================
// Binding / Decoding
// =============================================================================

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &FieldValue) -> SqliteQuery<'q> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Integer(i) => query.bind(*i),
        FieldValue::Real(f) => query.bind(*f),
        FieldValue::Boolean(b) => query.bind(*b),
        FieldValue::Timestamp(t) => query.bind(*t),
        FieldValue::Json(v) => query.bind(v.to_string()),
        FieldValue::Reference(id) => query.bind(id.to_string()),
    }
}

fn parse_uuid(column: &str, raw: &str) -> DbResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| DbError::decode(column, e.to_string()))
}

fn decode_field(row: &SqliteRow, field: &FieldDef, column: &str) -> DbResult<FieldValue> {
    let value = match &field.kind {
        FieldKind::Scalar(ScalarType::Text) => row
            .try_get::<Option<String>, _>(column)?
            .map(FieldValue::Text),
        FieldKind::Scalar(ScalarType::Integer) => row
            .try_get::<Option<i64>, _>(column)?
            .map(FieldValue::Integer),
        FieldKind::Scalar(ScalarType::Real) => row
            .try_get::<Option<f64>, _>(column)?
            .map(FieldValue::Real),
        FieldKind::Scalar(ScalarType::Boolean) => row
            .try_get::<Option<bool>, _>(column)?
            .map(FieldValue::Boolean),
        FieldKind::Scalar(ScalarType::Timestamp) => row
            .try_get::<Option<DateTime<Utc>>, _>(column)?
            .map(FieldValue::Timestamp),
        FieldKind::Scalar(ScalarType::Json) => match row.try_get::<Option<String>, _>(column)? {
            Some(raw) => Some(FieldValue::Json(
                serde_json::from_str(&raw).map_err(|e| DbError::decode(column, e.to_string()))?,
            )),
            None => None,
        },
        FieldKind::Reference { .. } => match row.try_get::<Option<String>, _>(column)? {
            Some(raw) => Some(FieldValue::Reference(parse_uuid(column, &raw)?)),
            None => None,
        },
        FieldKind::ManyToMany { .. } => None,
    };

    Ok(value.unwrap_or(FieldValue::Null))
}

fn decode_record(model: &SyncedModel, row: &SqliteRow) -> DbResult<StoredRecord> {
    let id: String = row.try_get(ID_COLUMN)?;
    let external_id: String = row.try_get(model.external_id_column())?;
    let last_sync_time: DateTime<Utc> = row.try_get(LAST_SYNC_TIME_COLUMN)?;

    let mut values = BTreeMap::new();
    for field in model.column_fields() {
        if let Some(column) = field.column_name() {
            values.insert(field.name.clone(), decode_field(row, field, &column)?);
        }
    }

    Ok(StoredRecord {
        id: parse_uuid(ID_COLUMN, &id)?,
        external_id,
        last_sync_time,
        values,
    })
}

fn select_sql(model: &SyncedModel) -> String {
    let mut columns = vec![
        quote_ident(ID_COLUMN),
        quote_ident(model.external_id_column()),
        quote_ident(LAST_SYNC_TIME_COLUMN),
    ];
    columns.extend(
        model
            .column_fields()
            .filter_map(FieldDef::column_name)
            .map(|c| quote_ident(&c)),
    );

    format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote_ident(model.table())
    )
}

fn join_table_for(model: &SyncedModel, field: &str) -> DbResult<String> {
    match model.field(field) {
        Some(def) if def.kind.is_many_to_many() => Ok(model.join_table(field)),
        _ => Err(DbError::Schema(format!(
            "{} has no many-to-many field '{}'",
            model.name(),
            field
        ))),
    }
}

// =============================================================================
// Connection-Level Operations
// =============================================================================

/// Looks up the local id of the row holding `external_id`.
pub async fn find_id(
    conn: &mut SqliteConnection,
    model: &SyncedModel,
    external_id: &ExternalId,
) -> DbResult<Option<Uuid>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        quote_ident(ID_COLUMN),
        quote_ident(model.table()),
        quote_ident(model.external_id_column())
    );

    let id: Option<String> = sqlx::query_scalar(&sql)
        .bind(external_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    id.map(|raw| parse_uuid(ID_COLUMN, &raw)).transpose()
}

/// Whether a row with local id `id` is stored.
pub async fn exists(conn: &mut SqliteConnection, model: &SyncedModel, id: Uuid) -> DbResult<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ?1",
        quote_ident(model.table()),
        quote_ident(ID_COLUMN)
    );
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

/// Inserts the row, or updates the columns present in `record.values`.
///
/// `external_id` and `last_sync_time` are always written.
pub async fn save(
    conn: &mut SqliteConnection,
    model: &SyncedModel,
    record: &RecordWrite<'_>,
) -> DbResult<()> {
    let mut columns = vec![
        ID_COLUMN.to_string(),
        model.external_id_column().to_string(),
        LAST_SYNC_TIME_COLUMN.to_string(),
    ];
    let mut values = Vec::with_capacity(record.values.len());

    for (name, value) in record.values {
        let column = model
            .field(name)
            .and_then(FieldDef::column_name)
            .ok_or_else(|| {
                DbError::Schema(format!("{} has no column for field '{}'", model.name(), name))
            })?;
        columns.push(column);
        values.push(value);
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("{col} = excluded.{col}", col = quote_ident(c)))
        .collect();

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
        quote_ident(model.table()),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
        quote_ident(ID_COLUMN),
        updates.join(", ")
    );

    let mut query = sqlx::query(&sql)
        .bind(record.id.to_string())
        .bind(record.external_id.as_str().to_string())
        .bind(record.sync_time);
    for value in values {
        query = bind_value(query, value);
    }
    query.execute(&mut *conn).await?;

    debug!(
        model = %model.name(),
        id = %record.id,
        external_id = %record.external_id,
        columns = record.values.len(),
        "Saved record"
    );
    Ok(())
}

/// Replaces the set of rows related through a many-to-many field.
///
/// Duplicate targets collapse into one link.
pub async fn replace_related(
    conn: &mut SqliteConnection,
    model: &SyncedModel,
    field: &str,
    source: Uuid,
    targets: &[Uuid],
) -> DbResult<()> {
    let join_table = join_table_for(model, field)?;

    let delete = format!(
        "DELETE FROM {} WHERE {} = ?1",
        quote_ident(&join_table),
        quote_ident(SOURCE_COLUMN)
    );
    sqlx::query(&delete)
        .bind(source.to_string())
        .execute(&mut *conn)
        .await?;

    let insert = format!(
        "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?1, ?2)",
        quote_ident(&join_table),
        quote_ident(SOURCE_COLUMN),
        quote_ident(TARGET_COLUMN)
    );
    for target in targets {
        sqlx::query(&insert)
            .bind(source.to_string())
            .bind(target.to_string())
            .execute(&mut *conn)
            .await?;
    }

    debug!(
        model = %model.name(),
        field = %field,
        source = %source,
        targets = targets.len(),
        "Replaced many-to-many relation"
    );
    Ok(())
}

/// Local ids related to `source` through a many-to-many field, sorted.
pub async fn related_ids(
    conn: &mut SqliteConnection,
    model: &SyncedModel,
    field: &str,
    source: Uuid,
) -> DbResult<Vec<Uuid>> {
    let join_table = join_table_for(model, field)?;
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1 ORDER BY {}",
        quote_ident(TARGET_COLUMN),
        quote_ident(&join_table),
        quote_ident(SOURCE_COLUMN),
        quote_ident(TARGET_COLUMN)
    );

    let ids: Vec<String> = sqlx::query_scalar(&sql)
        .bind(source.to_string())
        .fetch_all(&mut *conn)
        .await?;

    ids.iter().map(|raw| parse_uuid(TARGET_COLUMN, raw)).collect()
}

/// Loads one row by local id.
pub async fn load(
    conn: &mut SqliteConnection,
    model: &SyncedModel,
    id: Uuid,
) -> DbResult<Option<StoredRecord>> {
    let sql = format!("{} WHERE {} = ?1", select_sql(model), quote_ident(ID_COLUMN));

    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|r| decode_record(model, &r)).transpose()
}

/// Loads one row by external id.
pub async fn load_by_external_id(
    conn: &mut SqliteConnection,
    model: &SyncedModel,
    external_id: &ExternalId,
) -> DbResult<Option<StoredRecord>> {
    let sql = format!(
        "{} WHERE {} = ?1",
        select_sql(model),
        quote_ident(model.external_id_column())
    );

    let row = sqlx::query(&sql)
        .bind(external_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|r| decode_record(model, &r)).transpose()
}

/// Loads every row, ordered by external id.
pub async fn load_all(conn: &mut SqliteConnection, model: &SyncedModel) -> DbResult<Vec<StoredRecord>> {
    let sql = format!(
        "{} ORDER BY {}",
        select_sql(model),
        quote_ident(model.external_id_column())
    );

    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(|r| decode_record(model, r)).collect()
}

/// Counts the rows of a model.
pub async fn count(conn: &mut SqliteConnection, model: &SyncedModel) -> DbResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(model.table()));
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
    Ok(count)
}

// =============================================================================
// Pool-Level Repository
// =============================================================================

/// Read access to the rows of one model.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
    model: Arc<SyncedModel>,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool, model: Arc<SyncedModel>) -> Self {
        RecordRepository { pool, model }
    }

    pub fn model(&self) -> &SyncedModel {
        &self.model
    }

    pub async fn get(&self, id: Uuid) -> DbResult<Option<StoredRecord>> {
        let mut conn = self.pool.acquire().await?;
        load(&mut conn, &self.model, id).await
    }

    pub async fn get_by_external_id(&self, external_id: &ExternalId) -> DbResult<Option<StoredRecord>> {
        let mut conn = self.pool.acquire().await?;
        load_by_external_id(&mut conn, &self.model, external_id).await
    }

    /// Like `get_by_external_id`, failing with `NotFound` when absent.
    pub async fn require(&self, external_id: &ExternalId) -> DbResult<StoredRecord> {
        self.get_by_external_id(external_id)
            .await?
            .ok_or_else(|| DbError::not_found(self.model.name(), external_id.as_str()))
    }

    pub async fn all(&self) -> DbResult<Vec<StoredRecord>> {
        let mut conn = self.pool.acquire().await?;
        load_all(&mut conn, &self.model).await
    }

    pub async fn count(&self) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        count(&mut conn, &self.model).await
    }

    /// Local ids related to `id` through a many-to-many field.
    pub async fn related(&self, field: &str, id: Uuid) -> DbResult<Vec<Uuid>> {
        let mut conn = self.pool.acquire().await?;
        related_ids(&mut conn, &self.model, field, id).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
