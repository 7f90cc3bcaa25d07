//! In-memory datasource for tests and stubbing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use groundsync_core::{
    Datasource, DatasourceError, DatasourceResult, ExternalId, ListQuery, Resource,
    ValidationError, DEFAULT_IDENTITY_FIELD,
};

/// Serves a fixed set of resources.
///
/// The set can be replaced between passes. `list` ignores the query.
#[derive(Debug)]
pub struct MockDatasource {
    identity_field: String,
    resources: RwLock<Vec<Resource>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    fail_list: AtomicBool,
}

impl MockDatasource {
    pub fn new(resources: Vec<Resource>) -> Self {
        MockDatasource {
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            resources: RwLock::new(resources),
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        }
    }

    /// Builds the data set from JSON objects.
    pub fn from_values(values: Vec<Value>) -> Result<Self, ValidationError> {
        let resources = values
            .into_iter()
            .map(Resource::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(resources))
    }

    /// Reads identities from `field` instead of `id`.
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    /// Replaces the data set.
    pub async fn set_resources(&self, resources: Vec<Resource>) {
        *self.resources.write().await = resources;
    }

    /// Makes subsequent `list` calls fail with a transport error.
    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn identity_field(&self) -> &str {
        &self.identity_field
    }

    async fn list(&self, _query: &ListQuery) -> DatasourceResult<Vec<Resource>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(DatasourceError::transport("mock://list", "listing disabled"));
        }
        Ok(self.resources.read().await.clone())
    }

    async fn get(&self, id: &ExternalId) -> DatasourceResult<Resource> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.resources
            .read()
            .await
            .iter()
            .find(|r| self.identity_of(r).as_ref() == Some(id))
            .cloned()
            .ok_or_else(|| DatasourceError::not_found(id.as_str()))
    }
}
