//! # Validation Module
//!
//! Declaration-time validation for model, table and field names.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Declaration (THIS MODULE)                                    │
//! │  ├── Identifiers are plain SQL names                                   │
//! │  ├── Bookkeeping columns cannot be redeclared                          │
//! │  └── Runs once, when a model is registered                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Attribute mapping (field::ScalarType::coerce)                │
//! │  └── Each resource value is checked against its declared type          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── UNIQUE external id                                                │
//! │  └── Deferred foreign keys on references                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Name of the local primary key column on every model table.
pub const ID_COLUMN: &str = "id";

/// Name of the bookkeeping timestamp column on every model table.
pub const LAST_SYNC_TIME_COLUMN: &str = "last_sync_time";

/// Longest identifier accepted for tables and columns.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validates a table, column or model name.
///
/// ## Rules
/// - Must not be empty
/// - Must start with an ASCII letter or underscore
/// - Must contain only ASCII letters, digits and underscores
/// - At most 63 characters
///
/// ## Example
/// ```rust
/// use groundsync_core::validation::validate_identifier;
///
/// assert!(validate_identifier("parliament_member").is_ok());
/// assert!(validate_identifier("1st").is_err());
/// assert!(validate_identifier("drop table").is_err());
/// ```
pub fn validate_identifier(name: &str) -> CoreResult<()> {
    let invalid = |reason: &str| CoreError::InvalidIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    let first = chars.next().ok_or_else(|| invalid("must not be empty"))?;

    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(invalid("must start with a letter or underscore"));
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(
            "must contain only letters, numbers, and underscores",
        ));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("is too long"));
    }

    Ok(())
}

/// Validates a declared field name against the model's bookkeeping columns.
pub fn validate_field_name(model: &str, field: &str, external_id_field: &str) -> CoreResult<()> {
    validate_identifier(field)?;

    if field == ID_COLUMN || field == LAST_SYNC_TIME_COLUMN || field == external_id_field {
        return Err(CoreError::ReservedField {
            model: model.to_string(),
            field: field.to_string(),
        });
    }

    Ok(())
}

/// Validates an auto-sync interval.
pub fn validate_interval(model: &str, interval: Option<Duration>) -> CoreResult<()> {
    match interval {
        Some(d) if d.is_zero() => Err(CoreError::InvalidInterval {
            model: model.to_string(),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("person").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("ward_2019").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2019_ward").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier("quote\"d").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_reserved_fields() {
        assert!(validate_field_name("person", "name", "external_id").is_ok());

        for reserved in ["id", "last_sync_time", "external_id"] {
            assert!(matches!(
                validate_field_name("person", reserved, "external_id"),
                Err(CoreError::ReservedField { .. })
            ));
        }
    }

    #[test]
    fn test_validate_interval() {
        assert!(validate_interval("person", None).is_ok());
        assert!(validate_interval("person", Some(Duration::from_secs(60))).is_ok());
        assert!(validate_interval("person", Some(Duration::ZERO)).is_err());
    }
}
