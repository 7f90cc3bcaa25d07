//! # Cache
//!
//! TTL cache for expensive lookups (datasource `get` calls, derived values).
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CachedLookup { prefix, ttl, owner }                                    │
//! │       │  key = prefix[.owner][.part]                                    │
//! │       │                                                                 │
//! │       ├── hit  ──► deserialize, return (function not invoked)           │
//! │       └── miss ──► invoke function ──► set(key, value, ttl) ──► return  │
//! │                                                                         │
//! │  CacheStore (trait)                                                     │
//! │  ├── MemoryCache    process-local, per-entry expiry                     │
//! │  └── RedisCache     shared, SETEX expiry (`redis` feature)              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values are stored as JSON. A stored `null` is treated as a miss.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;

/// Default lifetime of a cached value.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(500);

// =============================================================================
// Store Contract
// =============================================================================

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Drops `key` if present.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// Builds a cache key from a prefix and an optional key part.
///
/// ```rust,ignore
/// assert_eq!(cache_key("person", Some("a")), "person.a");
/// assert_eq!(cache_key("person", None), "person");
/// ```
pub fn cache_key(prefix: &str, part: Option<&str>) -> String {
    match part {
        Some(part) => format!("{}.{}", prefix, part),
        None => prefix.to_string(),
    }
}

// =============================================================================
// In-Process Store
// =============================================================================

/// Process-local cache store.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until the next write.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

// =============================================================================
// Redis Store
// =============================================================================

#[cfg(feature = "redis")]
pub use self::redis_store::RedisCache;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use redis::aio::MultiplexedConnection;
    use redis::AsyncCommands;

    /// Cache store shared between workers through Redis.
    #[derive(Clone)]
    pub struct RedisCache {
        client: redis::Client,
    }

    impl RedisCache {
        /// Opens a client for `url` (`redis://host:6379/0`).
        ///
        /// No connection is made until the first command.
        pub fn open(url: &str) -> Result<Self, CacheError> {
            let client = redis::Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
            Ok(RedisCache { client })
        }

        async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))
        }
    }

    impl std::fmt::Debug for RedisCache {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisCache").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl CacheStore for RedisCache {
        async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
            let mut conn = self.connection().await?;
            let raw: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            raw.map(|s| serde_json::from_str(&s).map_err(CacheError::from))
                .transpose()
        }

        async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
            let mut conn = self.connection().await?;
            let secs = ttl.as_secs().max(1);
            let _: () = conn
                .set_ex(key, value.to_string(), secs)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            Ok(())
        }

        async fn remove(&self, key: &str) -> Result<(), CacheError> {
            let mut conn = self.connection().await?;
            let _: i64 = conn
                .del(key)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            Ok(())
        }
    }
}

// =============================================================================
// Cached Lookup
// =============================================================================

/// Memoizes a function's result in a [`CacheStore`] under a key prefix.
///
/// ## Example
/// ```rust,ignore
/// let lookup = CachedLookup::new(store, "exchange_rate", Duration::from_secs(60));
/// let rate: f64 = lookup
///     .get_or_fetch(Some("EUR"), || async { fetch_rate("EUR").await })
///     .await?;
/// ```
#[derive(Clone)]
pub struct CachedLookup {
    store: Arc<dyn CacheStore>,
    prefix: String,
    ttl: Duration,
    owner: Option<String>,
}

impl CachedLookup {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        CachedLookup {
            store,
            prefix: prefix.into(),
            ttl,
            owner: None,
        }
    }

    /// A lookup whose keys are also scoped by the owning instance.
    ///
    /// Keys become `prefix.owner` (no part) or `prefix.owner.part`.
    pub fn scoped_to(&self, owner: impl Into<String>) -> Self {
        CachedLookup {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            ttl: self.ttl,
            owner: Some(owner.into()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The store key for `part`.
    pub fn key(&self, part: Option<&str>) -> String {
        match &self.owner {
            Some(owner) => cache_key(&cache_key(&self.prefix, Some(owner)), part),
            None => cache_key(&self.prefix, part),
        }
    }

    /// Returns the cached value for `part`, calling `fetch` on a miss.
    ///
    /// `fetch` errors are returned as-is and nothing is stored.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, part: Option<&str>, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.key(part);

        if let Some(hit) = self.store.get(&key).await?.filter(|v| !v.is_null()) {
            debug!(key = %key, "Cache hit");
            return serde_json::from_value(hit).map_err(|e| E::from(CacheError::from(e)));
        }

        debug!(key = %key, "Cache miss");
        let value = fetch().await?;
        let encoded = serde_json::to_value(&value).map_err(|e| E::from(CacheError::from(e)))?;
        self.store.set(&key, encoded, self.ttl).await?;
        Ok(value)
    }

    /// Drops the cached value for `part`.
    pub async fn invalidate(&self, part: Option<&str>) -> Result<(), CacheError> {
        self.store.remove(&self.key(part)).await
    }
}

impl std::fmt::Debug for CachedLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedLookup")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("owner", &self.owner)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lookup(ttl: Duration) -> CachedLookup {
        CachedLookup::new(Arc::new(MemoryCache::new()), "rate", ttl)
    }

    async fn counted(calls: &AtomicUsize, value: i64) -> Result<i64, CacheError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    #[test]
    fn test_keys() {
        assert_eq!(cache_key("person", Some("a")), "person.a");
        assert_eq!(cache_key("person", None), "person");

        let lookup = lookup(DEFAULT_CACHE_TTL);
        assert_eq!(lookup.key(Some("EUR")), "rate.EUR");
        assert_eq!(lookup.key(None), "rate");

        let scoped = lookup.scoped_to("42");
        assert_eq!(scoped.key(None), "rate.42");
        assert_eq!(scoped.key(Some("EUR")), "rate.42.EUR");
    }

    #[tokio::test]
    async fn test_set_drops_expired_entries() {
        tokio::time::pause();
        let cache = MemoryCache::new();

        cache.set("rate.EUR", json!(1), Duration::from_secs(10)).await.unwrap();
        cache.set("rate.USD", json!(2), Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        cache.set("rate.GBP", json!(3), Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("rate.EUR").await.unwrap(), None);
        assert_eq!(cache.get("rate.USD").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_same_part_invokes_once() {
        let lookup = lookup(DEFAULT_CACHE_TTL);
        let calls = AtomicUsize::new(0);

        let first: i64 = lookup.get_or_fetch(Some("EUR"), || counted(&calls, 7)).await.unwrap();
        let second: i64 = lookup.get_or_fetch(Some("EUR"), || counted(&calls, 8)).await.unwrap();

        assert_eq!((first, second), (7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_parts_are_distinct() {
        let lookup = lookup(DEFAULT_CACHE_TTL);
        let calls = AtomicUsize::new(0);

        let eur: i64 = lookup.get_or_fetch(Some("EUR"), || counted(&calls, 1)).await.unwrap();
        let usd: i64 = lookup.get_or_fetch(Some("USD"), || counted(&calls, 2)).await.unwrap();

        assert_eq!((eur, usd), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiry_reinvokes() {
        tokio::time::pause();
        let lookup = lookup(Duration::from_secs(500));
        let calls = AtomicUsize::new(0);

        let _: i64 = lookup.get_or_fetch(None, || counted(&calls, 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(499)).await;
        let _: i64 = lookup.get_or_fetch(None, || counted(&calls, 2)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let refreshed: i64 = lookup.get_or_fetch(None, || counted(&calls, 3)).await.unwrap();
        assert_eq!(refreshed, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_error_is_not_cached() {
        let lookup = lookup(DEFAULT_CACHE_TTL);

        let failed: Result<i64, CacheError> = lookup
            .get_or_fetch(Some("x"), || async { Err(CacheError::Backend("boom".into())) })
            .await;
        assert!(failed.is_err());

        let calls = AtomicUsize::new(0);
        let value: i64 = lookup.get_or_fetch(Some("x"), || counted(&calls, 5)).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stored_null_is_a_miss() {
        let store = Arc::new(MemoryCache::new());
        store.set("rate.EUR", Value::Null, DEFAULT_CACHE_TTL).await.unwrap();
        let lookup = CachedLookup::new(store.clone(), "rate", DEFAULT_CACHE_TTL);
        let calls = AtomicUsize::new(0);

        let value: i64 = lookup.get_or_fetch(Some("EUR"), || counted(&calls, 9)).await.unwrap();
        assert_eq!(value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        lookup.invalidate(Some("EUR")).await.unwrap();
        assert!(store.get("rate.EUR").await.unwrap().is_none());
    }
}
