//! # groundsync-sync: Sync Engine for groundsync
//!
//! This crate pulls resources from external datasources into the local store
//! and keeps them there on a schedule.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 CronRegistrar (scheduling)                       │  │
//! │  │  one job per model with a sync interval                          │  │
//! │  │  run_due() in a poll loop, or run_all() once                     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ new session per run                    │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                 SyncManager (one pass)                           │  │
//! │  │  list() ──► per resource: transaction                            │  │
//! │  │             pre-register identity, sparse field update,          │  │
//! │  │             resolve references (embedded or by id)               │  │
//! │  │         ──► per resource: many-to-many set-replace               │  │
//! │  └───────────────┬───────────────────────────────┬──────────────────┘  │
//! │                  │                               │                      │
//! │  ┌───────────────▼──────────────┐  ┌─────────────▼──────────────────┐  │
//! │  │  Datasources                 │  │  groundsync-db                 │  │
//! │  │  Rest ──► Cached ──► Cache   │  │  records, m2m, sync runs       │  │
//! │  │  Mock (tests)                │  │                                │  │
//! │  └──────────────────────────────┘  └────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`manager`] - `SyncManager`, the per-pass engine
//! - [`cron`] - `CronRegistrar` and the polling driver
//! - [`datasource`] - REST, cached and mock datasources
//! - [`cache`] - TTL cache stores and `CachedLookup`
//! - [`config`] - Worker configuration and model declarations
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use groundsync_sync::{AppConfig, CronRegistrar, MemoryCache};
//!
//! let config = AppConfig::load(None)?;
//! let registry = Arc::new(config.build_registry(Arc::new(MemoryCache::new()))?);
//! let db = Database::new(config.database.db_config()).await?;
//! db.ensure_schema(&registry).await?;
//!
//! let report = groundsync_sync::sync_model(&db, &registry, "person").await?;
//! println!("synced {} of {}", report.synced, report.listed);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod config;
pub mod cron;
pub mod datasource;
pub mod error;
pub mod manager;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{cache_key, CacheStore, CachedLookup, MemoryCache, DEFAULT_CACHE_TTL};
#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use config::{AppConfig, ModelDeclaration};
pub use cron::{run_until, schedule_synced_models, CronRegistrar, CronRunSummary, CronTask};
pub use datasource::{CachedDatasource, MockDatasource, RestDatasource, RestDatasourceBuilder};
pub use error::{CacheError, SyncError, SyncResult};
pub use manager::{ModelSyncState, ResourceFailure, SyncManager, SyncReport};

use std::sync::Arc;

use groundsync_core::ModelRegistry;
use groundsync_db::Database;

/// Runs one pass for `model` in a fresh session.
pub async fn sync_model(
    db: &Database,
    registry: &Arc<ModelRegistry>,
    model: &str,
) -> SyncResult<SyncReport> {
    SyncManager::new(db.clone(), Arc::clone(registry))
        .sync_model(model)
        .await
}
