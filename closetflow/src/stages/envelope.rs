//! Validated view over an inference service response.

use serde_json::{Map, Value};

use crate::errors::{PipelineError, Result};

/// The JSON object returned by an inference call.
///
/// Handlers call [`ResponseEnvelope::require`] before reading any field so
/// a partially populated response never reaches the next stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseEnvelope {
    fields: Map<String, Value>,
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

impl ResponseEnvelope {
    /// Wraps an already-parsed JSON object.
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Wraps a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(PipelineError::response_missing(
                "response",
                vec![format!("<json object, got {}>", type_name(&other))],
            )),
        }
    }

    /// Fails with a validation error naming every blank required field.
    pub fn require(&self, stage: &str, required: &[&str]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|key| self.fields.get(**key).map_or(true, is_blank))
            .map(|key| (*key).to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::response_missing(stage, missing))
        }
    }

    /// Returns a non-blank string field.
    pub fn string(&self, key: &str) -> Result<String> {
        self.optional_string(key)
            .ok_or_else(|| PipelineError::response_missing("response", vec![key.to_string()]))
    }

    /// Returns a string field if present and non-blank.
    #[must_use]
    pub fn optional_string(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    }

    /// Returns the raw value of a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Consumes the envelope, returning the JSON object.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
