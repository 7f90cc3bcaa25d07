//! Datasource wrapper that memoizes `get(id)` through a [`CachedLookup`].
//!
//! `list` always goes to the wrapped datasource: every pass is a full resync.

use std::sync::Arc;

use async_trait::async_trait;

use groundsync_core::{Datasource, DatasourceResult, ExternalId, ListQuery, Resource};

use crate::cache::CachedLookup;

/// Caches single-resource fetches under `prefix.id`.
pub struct CachedDatasource {
    inner: Arc<dyn Datasource>,
    lookup: CachedLookup,
}

impl CachedDatasource {
    pub fn new(inner: Arc<dyn Datasource>, lookup: CachedLookup) -> Self {
        CachedDatasource { inner, lookup }
    }

    pub fn lookup(&self) -> &CachedLookup {
        &self.lookup
    }
}

impl std::fmt::Debug for CachedDatasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDatasource")
            .field("lookup", &self.lookup)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Datasource for CachedDatasource {
    fn identity_field(&self) -> &str {
        self.inner.identity_field()
    }

    async fn list(&self, query: &ListQuery) -> DatasourceResult<Vec<Resource>> {
        self.inner.list(query).await
    }

    async fn get(&self, id: &ExternalId) -> DatasourceResult<Resource> {
        self.lookup
            .get_or_fetch(Some(id.as_str()), || self.inner.get(id))
            .await
    }
}
