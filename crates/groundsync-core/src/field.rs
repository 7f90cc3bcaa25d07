//! # Field Declarations
//!
//! Typed field map for a synced model: each declared field knows its kind and
//! how to turn a resource value into a stored value.
//!
//! ## Field Kinds
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  FieldKind::Scalar(ScalarType)   copied after coercion                 │
//! │     text | integer | real | boolean | timestamp | json                 │
//! │                                                                         │
//! │  FieldKind::Reference { target }   resolved to the target's local id   │
//! │     "b"            → resolve_by_external_id(target, "b")               │
//! │     { "id": "b" }  → resolve_embedded_value(target, {...})             │
//! │                                                                         │
//! │  FieldKind::ManyToMany { target }  resolved after the row is saved     │
//! │     ["b", {..}]    → replace the relation with exactly those rows      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::resource::json_type_name;

// =============================================================================
// Scalar Type
// =============================================================================

/// Storage type of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    /// Any JSON value, stored serialized.
    Json,
}

impl ScalarType {
    /// Converts a resource value into a typed field value.
    ///
    /// ## Rules
    /// - `text` accepts strings only
    /// - `integer` accepts integral numbers (including `3.0`)
    /// - `real` accepts any number
    /// - `timestamp` accepts RFC 3339 strings and `YYYY-MM-DD` dates (UTC midnight)
    /// - `json` accepts anything
    ///
    /// ## Errors
    /// `TypeMismatch` when the JSON type is wrong, `InvalidFormat` when a
    /// timestamp string cannot be parsed.
    pub fn coerce(&self, field: &str, value: &Value) -> Result<FieldValue, ValidationError> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }

        let mismatch = || ValidationError::TypeMismatch {
            field: field.to_string(),
            expected: self.to_string(),
            found: json_type_name(value).to_string(),
        };

        match self {
            ScalarType::Text => value
                .as_str()
                .map(|s| FieldValue::Text(s.to_string()))
                .ok_or_else(mismatch),

            ScalarType::Integer => {
                if let Some(i) = value.as_i64() {
                    return Ok(FieldValue::Integer(i));
                }
                match value.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(FieldValue::Integer(f as i64))
                    }
                    _ => Err(mismatch()),
                }
            }

            ScalarType::Real => value.as_f64().map(FieldValue::Real).ok_or_else(mismatch),

            ScalarType::Boolean => value.as_bool().map(FieldValue::Boolean).ok_or_else(mismatch),

            ScalarType::Timestamp => {
                let raw = value.as_str().ok_or_else(mismatch)?;
                parse_timestamp(raw)
                    .map(FieldValue::Timestamp)
                    .ok_or_else(|| ValidationError::InvalidFormat {
                        field: field.to_string(),
                        reason: format!("'{}' is not an RFC 3339 timestamp or date", raw),
                    })
            }

            ScalarType::Json => Ok(FieldValue::Json(value.clone())),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Text => write!(f, "text"),
            ScalarType::Integer => write!(f, "integer"),
            ScalarType::Real => write!(f, "real"),
            ScalarType::Boolean => write!(f, "boolean"),
            ScalarType::Timestamp => write!(f, "timestamp"),
            ScalarType::Json => write!(f, "json"),
        }
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "string" => Ok(ScalarType::Text),
            "integer" | "int" => Ok(ScalarType::Integer),
            "real" | "float" => Ok(ScalarType::Real),
            "boolean" | "bool" => Ok(ScalarType::Boolean),
            "timestamp" | "datetime" => Ok(ScalarType::Timestamp),
            "json" => Ok(ScalarType::Json),
            _ => Err(format!("Unknown scalar type: {}", s)),
        }
    }
}

// =============================================================================
// Field Kind / Field Declaration
// =============================================================================

/// What a declared field holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),

    /// Single-valued reference to another synced model (by model name).
    Reference { target: String },

    /// Many-to-many collection of another synced model (by model name).
    ManyToMany { target: String },
}

impl FieldKind {
    /// Target model name for relation fields.
    pub fn target(&self) -> Option<&str> {
        match self {
            FieldKind::Scalar(_) => None,
            FieldKind::Reference { target } | FieldKind::ManyToMany { target } => Some(target),
        }
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self, FieldKind::ManyToMany { .. })
    }
}

/// One declared field on a synced model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,

    /// A new row cannot be saved without a value for this field.
    pub required: bool,
}

impl FieldDef {
    /// Declares a scalar field.
    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        FieldDef {
            name: name.into(),
            kind: FieldKind::Scalar(ty),
            required: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Real)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Timestamp)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Json)
    }

    /// Declares a single-valued reference to `target`.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        FieldDef {
            name: name.into(),
            kind: FieldKind::Reference {
                target: target.into(),
            },
            required: false,
        }
    }

    /// Declares a many-to-many collection of `target`.
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        FieldDef {
            name: name.into(),
            kind: FieldKind::ManyToMany {
                target: target.into(),
            },
            required: false,
        }
    }

    /// Marks the field as required on new rows.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Name of the column backing this field, `None` for many-to-many fields
    /// (those live in a join table).
    pub fn column_name(&self) -> Option<String> {
        match &self.kind {
            FieldKind::Scalar(_) => Some(self.name.clone()),
            FieldKind::Reference { .. } => Some(format!("{}_id", self.name)),
            FieldKind::ManyToMany { .. } => None,
        }
    }
}

// =============================================================================
// Field Value
// =============================================================================

/// A typed value ready to be written to (or read from) the record store.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(Value),
    /// Local id of a row of the referenced model.
    Reference(Uuid),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<Uuid> {
        match self {
            FieldValue::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
