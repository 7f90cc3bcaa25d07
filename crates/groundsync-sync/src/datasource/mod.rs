//! # Datasources
//!
//! Implementations of [`groundsync_core::Datasource`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  MockDatasource     in-memory data set, call counters, forced failures │
//! │  RestDatasource     JSON over HTTP, envelopes, cursor pagination       │
//! │  CachedDatasource   wraps any datasource, memoizes get(id)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod cached;
pub mod mock;
pub mod rest;

pub use cached::CachedDatasource;
pub use mock::MockDatasource;
pub use rest::{ResourceFilter, RestDatasource, RestDatasourceBuilder};
