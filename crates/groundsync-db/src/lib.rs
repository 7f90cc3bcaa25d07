//! # groundsync-db: Record Store for groundsync
//!
//! SQLite storage for synced models, using sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        groundsync Data Flow                             │
//! │                                                                         │
//! │  SyncManager::sync_model(person)                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  groundsync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │    Schema    │  │   │
//! │  │   │   (pool.rs)   │    │               │    │              │  │   │
//! │  │   │               │    │ records       │    │ model tables │  │   │
//! │  │   │ SqlitePool    │◄───│ sync_run      │    │ join tables  │  │   │
//! │  │   │ Transactions  │    │               │    │ + migrations │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   groundsync.db (WAL mode, deferred foreign keys)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use groundsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("./groundsync.db")).await?;
//! db.ensure_schema(&registry).await?;
//!
//! let people = db.records(registry.model("person")?.clone());
//! println!("{} people", people.count().await?);
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod schema;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::records::{self, RecordRepository, RecordWrite, StoredRecord};
pub use repository::sync_run::{SyncRun, SyncRunOutcome, SyncRunRepository, SyncRunStatus};
