//! # Model Schema
//!
//! Generates the tables backing each declared [`SyncedModel`].
//!
//! ## Table Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  person                                                                 │
//! │  ├── id              TEXT PRIMARY KEY        local UUID                 │
//! │  ├── external_id     TEXT NOT NULL UNIQUE    join key                   │
//! │  ├── last_sync_time  TEXT NOT NULL           pass start time            │
//! │  ├── name            TEXT                    scalar (nullable)          │
//! │  └── mentor_id       TEXT REFERENCES person(id)                         │
//! │                      DEFERRABLE INITIALLY DEFERRED                      │
//! │                                                                         │
//! │  person_friends                        one per many-to-many field      │
//! │  ├── source_id  → person(id)                                            │
//! │  ├── target_id  → person(id)                                            │
//! │  └── PRIMARY KEY (source_id, target_id)                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Foreign keys are deferred so rows that reference each other can be
//! written in any order inside one transaction.

use sqlx::SqlitePool;
use tracing::{debug, info};

use groundsync_core::validation::{ID_COLUMN, LAST_SYNC_TIME_COLUMN};
use groundsync_core::{FieldKind, ModelRegistry, ScalarType, SyncedModel};

use crate::error::{DbError, DbResult};

/// Join table column holding the owning row.
pub const SOURCE_COLUMN: &str = "source_id";

/// Join table column holding the related row.
pub const TARGET_COLUMN: &str = "target_id";

/// Quotes an identifier for SQLite.
///
/// Names are validated at declaration time, quoting keeps keywords such as
/// `order` or `group` usable as field names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Text | ScalarType::Timestamp | ScalarType::Json => "TEXT",
        ScalarType::Integer | ScalarType::Boolean => "INTEGER",
        ScalarType::Real => "REAL",
    }
}

fn target_table<'a>(registry: &'a ModelRegistry, model: &SyncedModel, target: &str) -> DbResult<&'a str> {
    registry.get(target).map(|m| m.table()).ok_or_else(|| {
        DbError::Schema(format!(
            "model {} references unregistered model {}",
            model.name(),
            target
        ))
    })
}

/// DDL for a model's own table.
pub fn create_table_sql(model: &SyncedModel, registry: &ModelRegistry) -> DbResult<String> {
    let mut columns = vec![
        format!("{} TEXT PRIMARY KEY NOT NULL", quote_ident(ID_COLUMN)),
        format!(
            "{} TEXT NOT NULL UNIQUE",
            quote_ident(model.external_id_column())
        ),
        format!("{} TEXT NOT NULL", quote_ident(LAST_SYNC_TIME_COLUMN)),
    ];

    for field in model.column_fields() {
        let Some(column) = field.column_name() else {
            continue;
        };
        match &field.kind {
            FieldKind::Scalar(ty) => {
                columns.push(format!("{} {}", quote_ident(&column), sql_type(*ty)));
            }
            FieldKind::Reference { target } => {
                let table = target_table(registry, model, target)?;
                columns.push(format!(
                    "{} TEXT REFERENCES {}({}) ON DELETE SET NULL DEFERRABLE INITIALLY DEFERRED",
                    quote_ident(&column),
                    quote_ident(table),
                    quote_ident(ID_COLUMN)
                ));
            }
            FieldKind::ManyToMany { .. } => {}
        }
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(model.table()),
        columns.join(",\n    ")
    ))
}

/// DDL for the join tables of a model's many-to-many fields.
pub fn create_join_tables_sql(model: &SyncedModel, registry: &ModelRegistry) -> DbResult<Vec<String>> {
    let mut statements = Vec::new();

    for field in model.many_to_many_fields() {
        let Some(target) = field.kind.target() else {
            continue;
        };
        let target = target_table(registry, model, target)?;
        let join_table = model.join_table(&field.name);

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {join} (\n    \
             {src} TEXT NOT NULL REFERENCES {owner}({id}) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,\n    \
             {tgt} TEXT NOT NULL REFERENCES {target}({id}) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,\n    \
             PRIMARY KEY ({src}, {tgt})\n)",
            join = quote_ident(&join_table),
            src = quote_ident(SOURCE_COLUMN),
            tgt = quote_ident(TARGET_COLUMN),
            owner = quote_ident(model.table()),
            target = quote_ident(target),
            id = quote_ident(ID_COLUMN),
        ));
    }

    Ok(statements)
}

/// Creates every model table and join table that does not exist yet.
///
/// Existing tables are left untouched; adding a field to a declaration does
/// not alter a table created before.
pub async fn ensure_schema(pool: &SqlitePool, registry: &ModelRegistry) -> DbResult<()> {
    let mut statements = Vec::new();
    for model in registry.models() {
        statements.push(create_table_sql(model, registry)?);
    }
    for model in registry.models() {
        statements.extend(create_join_tables_sql(model, registry)?);
    }

    let mut tx = pool.begin().await?;
    for statement in &statements {
        debug!(sql = %statement, "Applying model DDL");
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!(
        models = registry.len(),
        statements = statements.len(),
        "Model schema ensured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::person_registry;

    #[test]
    fn test_create_table_sql() {
        let registry = person_registry();
        let person = registry.model("person").unwrap();

        let sql = create_table_sql(person, &registry).unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"person\""));
        assert!(sql.contains("\"external_id\" TEXT NOT NULL UNIQUE"));
        assert!(sql.contains("\"last_sync_time\" TEXT NOT NULL"));
        assert!(sql.contains("\"age\" INTEGER"));
        assert!(sql.contains(
            "\"mentor_id\" TEXT REFERENCES \"person\"(\"id\") ON DELETE SET NULL DEFERRABLE INITIALLY DEFERRED"
        ));
        assert!(!sql.contains("friends"));
    }

    #[test]
    fn test_create_join_tables_sql() {
        let registry = person_registry();
        let person = registry.model("person").unwrap();

        let statements = create_join_tables_sql(person, &registry).unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("\"person_friends\""));
        assert!(statements[0].contains("PRIMARY KEY (\"source_id\", \"target_id\")"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
