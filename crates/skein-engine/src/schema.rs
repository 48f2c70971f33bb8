//! Validation scope capability.
//!
//! A [`Scope`] canonicalizes and validates a dynamic value: the workflow
//! input passes through one before execution starts, and a stage's declared
//! input schema rechecks the resolved stage input before delivery. The full
//! schema system lives outside the engine; the bundled scopes cover the
//! shapes the engine itself needs.

use std::fmt;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from scope validation.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The value is not a mapping where a mapping is required.
    #[error("expected a mapping, got {0}")]
    NotAnObject(&'static str),

    /// A required property is absent.
    #[error("missing required property '{0}'")]
    MissingProperty(String),

    /// Any other validation failure.
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Short type label for a dynamic value, used in error messages.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Canonicalize and validate a dynamic value.
///
/// `unserialize` returns the canonical form of the value, or an error if the
/// value does not conform.
pub trait Scope: fmt::Debug + Send + Sync {
    fn unserialize(&self, value: &Value) -> Result<Value, SchemaError>;
}

// ---------------------------------------------------------------------------
// Bundled scopes
// ---------------------------------------------------------------------------

/// Accepts any value unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyScope;

impl Scope for AnyScope {
    fn unserialize(&self, value: &Value) -> Result<Value, SchemaError> {
        Ok(value.clone())
    }
}

/// Requires a mapping with a set of required properties present.
#[derive(Debug, Clone, Default)]
pub struct ObjectScope {
    required: Vec<String>,
}

impl ObjectScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a property to be present.
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }
}

impl Scope for ObjectScope {
    fn unserialize(&self, value: &Value) -> Result<Value, SchemaError> {
        let Value::Object(map) = value else {
            return Err(SchemaError::NotAnObject(value_kind(value)));
        };
        for key in &self.required {
            if !map.contains_key(key) {
                return Err(SchemaError::MissingProperty(key.clone()));
            }
        }
        Ok(value.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
