//! # Error Types
//!
//! Declaration, validation and datasource error types for groundsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  groundsync-core errors (this file)                                    │
//! │  ├── CoreError        - Configuration errors (fail fast at declare)    │
//! │  ├── ValidationError  - A resource does not fit the declared shape     │
//! │  └── DatasourceError  - NotFound / Transport / Decode from a source    │
//! │                                                                         │
//! │  groundsync-db errors (separate crate)                                 │
//! │  └── DbError          - Record store failures                          │
//! │                                                                         │
//! │  groundsync-sync errors (separate crate)                               │
//! │  └── SyncError        - What a sync pass / cron job reports            │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → log / SyncReport      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (model, field, external id)
//! 3. Errors are enum variants, never String

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Configuration errors raised while declaring or registering models.
///
/// These are detected at declaration time, never in the middle of a sync pass.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A model was declared without a datasource.
    ///
    /// ## When This Occurs
    /// - `SyncConfig::builder()` finished without `.datasource(..)`
    /// - A model declaration was built without any `SyncConfig`
    #[error("Model {model} has no datasource configured")]
    MissingDatasource { model: String },

    /// A model, table or field name is not a plain SQL identifier.
    #[error("Invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// Two fields on one model share a name.
    #[error("Model {model} declares field '{field}' more than once")]
    DuplicateField { model: String, field: String },

    /// A declared field collides with a bookkeeping column.
    ///
    /// ## When This Occurs
    /// - Declaring `id`, `last_sync_time` or the external-id column as a field
    #[error("Model {model} cannot declare reserved field '{field}'")]
    ReservedField { model: String, field: String },

    /// `field_map` names a local field the model does not declare.
    #[error("Model {model} maps unknown field '{field}'")]
    UnknownMappedField { model: String, field: String },

    /// A reference or many-to-many field points at an unregistered model.
    #[error("Model {model} field '{field}' references unknown model '{target}'")]
    UnknownReferenceTarget {
        model: String,
        field: String,
        target: String,
    },

    /// A model name was looked up but never registered.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// A model name (or table name) was registered twice.
    #[error("Model {0} is already registered")]
    DuplicateModel(String),

    /// A sync interval of zero would run the job on every poll.
    #[error("Model {model} has a zero sync interval")]
    InvalidInterval { model: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// A resource (or one of its values) does not match the declared local shape.
///
/// Raised while mapping a single resource; the resource's transaction is
/// rolled back and the sync pass moves on to the next resource.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing on a new row.
    #[error("{field} is required")]
    Required { field: String },

    /// A value has the wrong JSON type for the declared field.
    #[error("{field} expected {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// Invalid format (e.g., unparseable timestamp).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A resource (or embedded resource) is not a JSON object.
    #[error("{context} is not an object (got {found})")]
    NotAnObject { context: String, found: String },

    /// The resource carries no usable external identity.
    #[error("Resource for {model} has no identity in field '{field}'")]
    MissingIdentity { model: String, field: String },
}

// =============================================================================
// Datasource Error
// =============================================================================

/// Errors surfaced by a [`crate::Datasource`].
#[derive(Debug, Error)]
pub enum DatasourceError {
    /// `get(id)` found nothing for the identity.
    ///
    /// ## When This Occurs
    /// - A resource references an external id the datasource does not know
    /// - The remote API answered 404
    #[error("Resource not found: {id}")]
    NotFound { id: String },

    /// The remote call failed or answered with a non-success status.
    #[error("Transport error for {url}: {message}")]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// The response could not be turned into resources.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Any other backend failure (cache store, client construction).
    #[error("Datasource backend error: {0}")]
    Backend(String),
}

impl DatasourceError {
    /// Creates a NotFound error for the given identity.
    pub fn not_found(id: impl Into<String>) -> Self {
        DatasourceError::NotFound { id: id.into() }
    }

    /// Creates a Transport error without an HTTP status.
    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        DatasourceError::Transport {
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for datasource calls.
pub type DatasourceResult<T> = Result<T, DatasourceError>;

// =============================================================================
// Unit Tests
// =============================================================================
