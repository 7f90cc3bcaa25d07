//! # Datasource Contract
//!
//! The capability every synced model is backed by.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Datasource                                                             │
//! │  ├── list(query)      → every matching Resource (pagination hidden)     │
//! │  ├── get(id)          → exactly one Resource, or NotFound               │
//! │  ├── identity_field() → "id" unless overridden                          │
//! │  └── identity_of(r)   → ExternalId extracted from a Resource            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations are read-only. Concrete ones (in-memory mock, REST,
//! cache-backed) live in `groundsync-sync`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::DatasourceResult;
use crate::resource::{ExternalId, Resource};

/// Query parameters passed to [`Datasource::list`].
pub type ListQuery = BTreeMap<String, String>;

/// Default field holding a resource's identity.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// Read-only access to an external collection of resources.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Field of a resource that yields its identity.
    fn identity_field(&self) -> &str {
        DEFAULT_IDENTITY_FIELD
    }

    /// Lists every resource matching `query`.
    async fn list(&self, query: &ListQuery) -> DatasourceResult<Vec<Resource>>;

    /// Fetches one resource by its external identity.
    async fn get(&self, id: &ExternalId) -> DatasourceResult<Resource>;

    /// Extracts a resource's external identity.
    fn identity_of(&self, resource: &Resource) -> Option<ExternalId> {
        resource.identity(self.identity_field())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatasourceError;
    use serde_json::json;

    struct Fixed(Vec<Resource>);

    #[async_trait]
    impl Datasource for Fixed {
        fn identity_field(&self) -> &str {
            "code"
        }

        async fn list(&self, _query: &ListQuery) -> DatasourceResult<Vec<Resource>> {
            Ok(self.0.clone())
        }

        async fn get(&self, id: &ExternalId) -> DatasourceResult<Resource> {
            self.0
                .iter()
                .find(|r| self.identity_of(r).as_ref() == Some(id))
                .cloned()
                .ok_or_else(|| DatasourceError::not_found(id.as_str()))
        }
    }

    #[tokio::test]
    async fn test_identity_of_uses_identity_field() {
        let source = Fixed(vec![
            Resource::from_value(json!({"code": "E14000530", "name": "Camberwell"})).unwrap(),
        ]);

        let listed = source.list(&ListQuery::new()).await.unwrap();
        assert_eq!(
            source.identity_of(&listed[0]),
            Some(ExternalId::new("E14000530"))
        );

        assert!(source.get(&ExternalId::new("E14000530")).await.is_ok());
        assert!(matches!(
            source.get(&ExternalId::new("missing")).await,
            Err(DatasourceError::NotFound { .. })
        ));
    }
}
