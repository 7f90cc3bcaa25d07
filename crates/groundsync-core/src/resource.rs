//! # Resources
//!
//! The external side of a sync: what a datasource hands back.
//!
//! ## Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Resource (JSON object, immutable once read)                            │
//! │                                                                         │
//! │  {                                                                      │
//! │    "id":      "a",                 ← identity (datasource identity_field)│
//! │    "name":    "Alice",             ← scalar                             │
//! │    "teacher": "b",                 ← bare identity → fetch if unknown   │
//! │    "office":  { "id": "o1", ... }, ← embedded resource → no fetch       │
//! │    "friends": ["b", "c"]           ← many-to-many collection            │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

// =============================================================================
// External Identity
// =============================================================================

/// The identity of a resource in its external system.
///
/// Strings (UUIDs included) and integers are identities. They are compared in
/// textual form, so `5` and `"5"` name the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Creates an identity from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        ExternalId(id.into())
    }

    /// Extracts an identity from a JSON value.
    ///
    /// Returns `None` for anything that is not a string or an integer
    /// (objects are embedded resources, not identities).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(ExternalId(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ExternalId(n.to_string())),
            _ => None,
        }
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        ExternalId(s.to_string())
    }
}

impl From<String> for ExternalId {
    fn from(s: String) -> Self {
        ExternalId(s)
    }
}

/// Returns true if `value` is a bare identity rather than an embedded object.
pub fn is_identifier(value: &Value) -> bool {
    ExternalId::from_value(value).is_some()
}

// =============================================================================
// Resource
// =============================================================================

/// One record read from an external datasource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    fields: Map<String, Value>,
}

impl Resource {
    /// Creates a resource from a JSON object map.
    pub fn new(fields: Map<String, Value>) -> Self {
        Resource { fields }
    }

    /// Converts a JSON value into a resource.
    ///
    /// ## Errors
    /// `ValidationError::NotAnObject` if `value` is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(fields) => Ok(Resource { fields }),
            other => Err(ValidationError::NotAnObject {
                context: "resource".to_string(),
                found: json_type_name(&other).to_string(),
            }),
        }
    }

    /// Returns the raw value for `key`, `None` if the key is absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns the value for `key`, treating JSON `null` as absent.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Returns the identity stored under `key`.
    pub fn identity(&self, key: &str) -> Option<ExternalId> {
        self.value(key).and_then(ExternalId::from_value)
    }

    /// Returns true if the resource carries `key` (even as null).
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Iterates over field names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consumes the resource and returns it as a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl TryFrom<Value> for Resource {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Resource::from_value(value)
    }
}

/// Human-readable JSON type name, used in validation messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "real",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_external_id_from_value() {
        assert_eq!(ExternalId::from_value(&json!("abc")), Some(ExternalId::new("abc")));
        assert_eq!(ExternalId::from_value(&json!(42)), Some(ExternalId::new("42")));
        assert_eq!(ExternalId::from_value(&json!("")), None);
        assert_eq!(ExternalId::from_value(&json!(1.5)), None);
        assert_eq!(ExternalId::from_value(&json!({"id": "a"})), None);
        assert_eq!(ExternalId::from_value(&Value::Null), None);
    }

    #[test]
    fn test_integer_and_string_ids_collapse() {
        assert_eq!(
            ExternalId::from_value(&json!(5)),
            ExternalId::from_value(&json!("5"))
        );
    }

    #[test]
    fn test_resource_requires_object() {
        assert!(Resource::from_value(json!({"id": "a"})).is_ok());

        let err = Resource::from_value(json!(["a"])).unwrap_err();
        assert!(matches!(err, ValidationError::NotAnObject { ref found, .. } if found == "array"));
    }

    #[test]
    fn test_null_is_absent() {
        let resource = Resource::from_value(json!({"id": "a", "name": null})).unwrap();

        assert!(resource.contains("name"));
        assert!(resource.get("name").is_some());
        assert!(resource.value("name").is_none());
        assert!(resource.value("missing").is_none());
        assert_eq!(resource.identity("id"), Some(ExternalId::new("a")));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier(&json!("b")));
        assert!(is_identifier(&json!(7)));
        assert!(!is_identifier(&json!({"id": "b"})));
        assert!(!is_identifier(&json!(["b"])));
    }
}
