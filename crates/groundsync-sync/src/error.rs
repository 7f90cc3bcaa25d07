//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Datasource    │  │     Validation          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  CoreError      │  │  NotFound       │  │  TypeMismatch           │ │
//! │  │  InvalidConfig  │  │  Transport      │  │  Required               │ │
//! │  │  InvalidUrl     │  │  Decode         │  │  MissingIdentity        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                             │
//! │  │    Database     │  │     Cache       │                             │
//! │  │                 │  │                 │                             │
//! │  │  DbError        │  │  Backend        │                             │
//! │  │                 │  │  Serialization  │                             │
//! │  └─────────────────┘  └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Validation, NotFound and reference-fetch Transport errors abort one
//! resource; a Transport error from `list()` aborts the pass.

use groundsync_core::{CoreError, DatasourceError, ValidationError};
use groundsync_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A model declaration was rejected.
    ///
    /// ## When This Occurs
    /// - Missing datasource, reserved or duplicate field names
    /// - `field_map` naming an undeclared field
    /// - Unknown reference target or model name
    #[error("Configuration error: {0}")]
    Configuration(#[from] CoreError),

    /// Invalid worker configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid datasource or cache URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// A resource does not fit the declared model.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A datasource call failed.
    #[error("Datasource error: {0}")]
    Datasource(#[from] DatasourceError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The record store failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// The cache store failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by a [`crate::cache::CacheStore`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store is unreachable or rejected the command.
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// A value could not be converted to or from JSON.
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Database(DbError::from(err))
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<CacheError> for DatasourceError {
    fn from(err: CacheError) -> Self {
        DatasourceError::Backend(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the next scheduled run may succeed without changes.
    ///
    /// ## Retryable Errors
    /// - Datasource transport failures (network, non-success status)
    /// - Pool exhaustion and lost connections
    /// - Unreachable cache backend
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Datasource(DatasourceError::Transport { .. }) => true,
            SyncError::Database(db) => db.is_transient(),
            SyncError::Cache(CacheError::Backend(_)) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_)
                | SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
        )
    }
}
