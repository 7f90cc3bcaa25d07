//! # groundsync-core: Declarations for groundsync
//!
//! This crate describes *what* is synced: resources read from external
//! datasources, the local models they feed, and the configuration binding the
//! two. It performs no I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        groundsync Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 groundsync-worker (apps/worker)                 │   │
//! │  │        config ──► registry ──► cron loop / --once               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    groundsync-sync                              │   │
//! │  │   SyncManager • CronRegistrar • Cache • Mock/REST datasources   │   │
//! │  └──────────────┬──────────────────────────────┬───────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────────┐  ┌────────▼───────────────────┐   │
//! │  │  ★ groundsync-core (THIS) ★     │  │      groundsync-db         │   │
//! │  │  Resource  ExternalId           │  │  SQLite pool, schema,      │   │
//! │  │  SyncedModel  SyncConfig        │◄─┤  record upserts, m2m,      │   │
//! │  │  FieldDef  ModelRegistry        │  │  sync run history          │   │
//! │  │  trait Datasource               │  └────────────────────────────┘   │
//! │  └─────────────────────────────────┘                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`resource`] - Resource and ExternalId
//! - [`datasource`] - The Datasource contract
//! - [`field`] - Field declarations and typed coercion
//! - [`model`] - SyncedModel and SyncConfig
//! - [`registry`] - ModelRegistry
//! - [`validation`] - Declaration-time name checks
//! - [`error`] - Error types
//!
//! ## Example Usage
//!
//! ```rust
//! use groundsync_core::{FieldValue, ScalarType};
//! use serde_json::json;
//!
//! let value = ScalarType::Timestamp.coerce("elected", &json!("2019-12-12")).unwrap();
//! assert!(matches!(value, FieldValue::Timestamp(_)));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod datasource;
pub mod error;
pub mod field;
pub mod model;
pub mod registry;
pub mod resource;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use datasource::{Datasource, ListQuery, DEFAULT_IDENTITY_FIELD};
pub use error::{
    CoreError, CoreResult, DatasourceError, DatasourceResult, ValidationError,
};
pub use field::{FieldDef, FieldKind, FieldValue, ScalarType};
pub use model::{
    SyncConfig, SyncConfigBuilder, SyncedModel, SyncedModelBuilder, DEFAULT_EXTERNAL_ID_FIELD,
    DEFAULT_SYNC_INTERVAL,
};
pub use registry::ModelRegistry;
pub use resource::{is_identifier, ExternalId, Resource};

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;

    use crate::datasource::{Datasource, ListQuery};
    use crate::error::{DatasourceError, DatasourceResult};
    use crate::resource::{ExternalId, Resource};

    /// Datasource over a fixed list, for declaration tests.
    #[derive(Debug, Default)]
    pub struct StaticDatasource {
        pub resources: Vec<Resource>,
    }

    #[async_trait]
    impl Datasource for StaticDatasource {
        async fn list(&self, _query: &ListQuery) -> DatasourceResult<Vec<Resource>> {
            Ok(self.resources.clone())
        }

        async fn get(&self, id: &ExternalId) -> DatasourceResult<Resource> {
            self.resources
                .iter()
                .find(|r| self.identity_of(r).as_ref() == Some(id))
                .cloned()
                .ok_or_else(|| DatasourceError::not_found(id.as_str()))
        }
    }
}
