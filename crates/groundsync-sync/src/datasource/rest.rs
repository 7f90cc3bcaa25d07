//! # REST Datasource
//!
//! Generic JSON-over-HTTP datasource.
//!
//! ## Request Shapes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  endpoint = base_url + path            https://api.example.com/people  │
//! │                                                                         │
//! │  list(query)                                                            │
//! │    GET {endpoint}?{query}[&{cursor_param}={cursor}]                     │
//! │       │                                                                 │
//! │       ├── items at `items_pointer` (or the body itself): JSON array     │
//! │       ├── keep items accepted by `filter`                               │
//! │       └── cursor at `next_cursor_pointer`? ──► fetch next page          │
//! │                                                                         │
//! │  get(id)                                                                │
//! │    GET {endpoint}/{id}/                                                 │
//! │       └── record at `record_pointer` (or the body itself): JSON object  │
//! │                                                                         │
//! │  404 on get ──► NotFound     other non-2xx ──► Transport { status }     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The request timeout is the only guard against a hung remote.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use groundsync_core::{
    Datasource, DatasourceError, DatasourceResult, ExternalId, ListQuery, Resource,
    DEFAULT_IDENTITY_FIELD,
};

use crate::error::{SyncError, SyncResult};

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Predicate applied to listed resources; rejected resources are dropped.
pub type ResourceFilter = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct CursorPaging {
    next_pointer: String,
    param: String,
}

// =============================================================================
// Datasource
// =============================================================================

/// Datasource backed by a JSON REST endpoint.
#[derive(Clone)]
pub struct RestDatasource {
    client: Client,
    endpoint: Url,
    identity_field: String,
    items_pointer: Option<String>,
    record_pointer: Option<String>,
    cursor: Option<CursorPaging>,
    filter: Option<ResourceFilter>,
}

impl RestDatasource {
    pub fn builder(base_url: impl Into<String>) -> RestDatasourceBuilder {
        RestDatasourceBuilder::new(base_url)
    }

    /// The collection URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The URL of one record: `{endpoint}/{id}/`.
    pub fn record_url(&self, id: &ExternalId) -> DatasourceResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| DatasourceError::Backend(format!("{} cannot be a base", self.endpoint)))?
            .pop_if_empty()
            .push(id.as_str())
            .push("");
        Ok(url)
    }

    async fn fetch(&self, url: Url, params: &[(String, String)]) -> DatasourceResult<Value> {
        debug!(url = %url, params = params.len(), "GET");

        let mut request = self.client.get(url.clone());
        if !params.is_empty() {
            request = request.query(params);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DatasourceError::transport(url.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DatasourceError::Transport {
                url: url.to_string(),
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DatasourceError::Decode(e.to_string()))
    }

    fn accepts(&self, resource: &Resource) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(resource))
    }
}

impl fmt::Debug for RestDatasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestDatasource")
            .field("endpoint", &self.endpoint.as_str())
            .field("identity_field", &self.identity_field)
            .field("items_pointer", &self.items_pointer)
            .field("record_pointer", &self.record_pointer)
            .field("cursor", &self.cursor)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

#[async_trait]
impl Datasource for RestDatasource {
    fn identity_field(&self) -> &str {
        &self.identity_field
    }

    async fn list(&self, query: &ListQuery) -> DatasourceResult<Vec<Resource>> {
        let mut params: Vec<(String, String)> =
            query.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut resources = Vec::new();
        let mut pages = 0usize;
        let mut cursors: HashSet<String> = match &self.cursor {
            Some(paging) => params
                .iter()
                .filter(|(k, _)| *k == paging.param)
                .map(|(_, v)| v.clone())
                .collect(),
            None => HashSet::new(),
        };

        loop {
            let body = self.fetch(self.endpoint.clone(), &params).await?;
            pages += 1;

            for item in extract_items(&body, self.items_pointer.as_deref())? {
                if self.accepts(&item) {
                    resources.push(item);
                }
            }

            let Some(paging) = &self.cursor else { break };
            let Some(next) = next_cursor(&body, &paging.next_pointer) else { break };

            if !cursors.insert(next.clone()) {
                debug!(endpoint = %self.endpoint, cursor = %next, "Cursor repeated, stopping");
                break;
            }

            match params.iter_mut().find(|(k, _)| *k == paging.param) {
                Some((_, current)) => *current = next,
                None => params.push((paging.param.clone(), next)),
            }
        }

        debug!(
            endpoint = %self.endpoint,
            pages,
            resources = resources.len(),
            "Listed resources"
        );
        Ok(resources)
    }

    async fn get(&self, id: &ExternalId) -> DatasourceResult<Resource> {
        let url = self.record_url(id)?;

        let body = match self.fetch(url, &[]).await {
            Err(DatasourceError::Transport {
                status: Some(status),
                ..
            }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Err(DatasourceError::not_found(id.as_str()));
            }
            other => other?,
        };

        let record = match &self.record_pointer {
            Some(pointer) => body.pointer(pointer).cloned().ok_or_else(|| {
                DatasourceError::Decode(format!("no record at '{}' for {}", pointer, id))
            })?,
            None => body,
        };

        Resource::from_value(record).map_err(|e| DatasourceError::Decode(e.to_string()))
    }
}

/// Items of a list response, at `pointer` or the body itself.
fn extract_items(body: &Value, pointer: Option<&str>) -> DatasourceResult<Vec<Resource>> {
    let items = match pointer {
        Some(pointer) => body
            .pointer(pointer)
            .ok_or_else(|| DatasourceError::Decode(format!("no items at '{}'", pointer)))?,
        None => body,
    };

    let Value::Array(items) = items else {
        return Err(DatasourceError::Decode(format!(
            "expected an array of resources, got {}",
            groundsync_core::resource::json_type_name(items)
        )));
    };

    items
        .iter()
        .cloned()
        .map(|item| Resource::from_value(item).map_err(|e| DatasourceError::Decode(e.to_string())))
        .collect()
}

/// Cursor for the next page; absent, null and empty mean "last page".
fn next_cursor(body: &Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`RestDatasource`].
///
/// ## Example
/// ```rust,ignore
/// let people = RestDatasource::builder("https://api.example.com")
///     .path("people/")
///     .header("Authorization", "Token abc")
///     .items_pointer("/results")
///     .cursor("/next_cursor", "cursor")
///     .build()?;
/// ```
#[derive(Clone)]
pub struct RestDatasourceBuilder {
    base_url: String,
    path: String,
    identity_field: String,
    headers: Vec<(String, String)>,
    items_pointer: Option<String>,
    record_pointer: Option<String>,
    next_cursor_pointer: Option<String>,
    cursor_param: Option<String>,
    filter: Option<ResourceFilter>,
    timeout: Duration,
}

impl RestDatasourceBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        RestDatasourceBuilder {
            base_url: base_url.into(),
            path: String::new(),
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            headers: Vec::new(),
            items_pointer: None,
            record_pointer: None,
            next_cursor_pointer: None,
            cursor_param: None,
            filter: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Collection path appended to the base URL. A trailing `/` is kept.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    /// Adds a header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON pointer to the item array of a list response.
    pub fn items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = Some(pointer.into());
        self
    }

    /// JSON pointer to the record object of a single-record response.
    pub fn record_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.record_pointer = Some(pointer.into());
        self
    }

    /// Enables cursor pagination: the cursor found at `next_pointer` is sent
    /// back as query parameter `param` until a page has none.
    pub fn cursor(mut self, next_pointer: impl Into<String>, param: impl Into<String>) -> Self {
        self.next_cursor_pointer = Some(next_pointer.into());
        self.cursor_param = Some(param.into());
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Resource) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> SyncResult<RestDatasource> {
        let endpoint = endpoint_url(&self.base_url, &self.path)?;

        for pointer in [&self.items_pointer, &self.record_pointer, &self.next_cursor_pointer]
            .into_iter()
            .flatten()
        {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(SyncError::InvalidConfig(format!(
                    "JSON pointer '{}' must start with '/'",
                    pointer
                )));
            }
        }

        let cursor = match (self.next_cursor_pointer, self.cursor_param) {
            (Some(next_pointer), Some(param)) if !param.is_empty() => {
                Some(CursorPaging { next_pointer, param })
            }
            (None, None) => None,
            _ => {
                return Err(SyncError::InvalidConfig(
                    "cursor pagination needs both a cursor pointer and a query parameter".into(),
                ))
            }
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SyncError::InvalidConfig(format!("header '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SyncError::InvalidConfig(format!("header '{}': {}", name, e)))?;
            headers.insert(header, value);
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("http client: {}", e)))?;

        Ok(RestDatasource {
            client,
            endpoint,
            identity_field: self.identity_field,
            items_pointer: self.items_pointer.filter(|p| !p.is_empty()),
            record_pointer: self.record_pointer.filter(|p| !p.is_empty()),
            cursor,
            filter: self.filter,
        })
    }
}

impl fmt::Debug for RestDatasourceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestDatasourceBuilder")
            .field("base_url", &self.base_url)
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn endpoint_url(base_url: &str, path: &str) -> SyncResult<Url> {
    let mut url = Url::parse(base_url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::InvalidUrl(format!(
            "datasource URL must be http(s), got: {}",
            base_url
        )));
    }

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(format!("{} cannot be a base", base_url)))?;
        segments.pop_if_empty();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            segments.push(segment);
        }
        if path.ends_with('/') {
            segments.push("");
        }
    }

    Ok(url)
}

// =============================================================================
// Unit Tests
// =============================================================================
