//! Response schemas as plain values.
//!
//! A schema names the structured object a generator call must return. The
//! cache key uses `name` and the field list, never the address of a Rust
//! type, so keys stay stable across runs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ConsistencyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Probability,
    Boolean,
    /// RFC 3339 datetime string.
    Datetime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSchema {
    pub name: String,
    pub fields: Vec<Field>,
}

impl ResponseSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    /// Title and resolution criteria of a new question.
    pub fn question() -> Self {
        Self::new("ForecastingQuestion")
            .field("title", FieldKind::String)
            .field("body", FieldKind::String)
    }

    /// Question whose resolution date the generator may move.
    pub fn dated_question() -> Self {
        Self::new("DatedForecastingQuestion")
            .field("title", FieldKind::String)
            .field("body", FieldKind::String)
            .optional("resolution_date", FieldKind::Datetime)
    }

    pub fn verification() -> Self {
        Self::new("VerificationResult")
            .field("valid", FieldKind::Boolean)
            .field("score", FieldKind::Probability)
            .optional("reasoning", FieldKind::String)
    }

    pub fn probability() -> Self {
        Self::new("Prob")
            .field("prob", FieldKind::Probability)
            .optional("reasoning", FieldKind::String)
    }

    /// Stable description used in cache keys and prompts.
    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "fields": self.fields.iter().map(|f| json!({
                "name": f.name,
                "kind": f.kind,
                "required": f.required,
            })).collect::<Vec<_>>(),
        })
    }

    /// JSON Schema for providers that accept structured output hints.
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let spec = match field.kind {
                FieldKind::String => json!({"type": "string"}),
                FieldKind::Number => json!({"type": "number"}),
                FieldKind::Probability => json!({"type": "number", "minimum": 0.0, "maximum": 1.0}),
                FieldKind::Boolean => json!({"type": "boolean"}),
                FieldKind::Datetime => json!({"type": "string", "format": "date-time"}),
            };
            properties.insert(field.name.clone(), spec);
            if field.required {
                required.push(Value::String(field.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check that a generator response carries every required field with the
    /// declared kind.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let object = value.as_object().ok_or_else(|| {
            ConsistencyError::Schema(format!("{}: response is not an object", self.name))
        })?;
        for field in &self.fields {
            let Some(v) = object.get(&field.name).filter(|v| !v.is_null()) else {
                if field.required {
                    return Err(ConsistencyError::Schema(format!(
                        "{}: missing field '{}'",
                        self.name, field.name
                    )));
                }
                continue;
            };
            let ok = match field.kind {
                FieldKind::String => v.as_str().is_some_and(|s| !s.trim().is_empty()),
                FieldKind::Number => v.as_f64().is_some_and(f64::is_finite),
                FieldKind::Probability => v.as_f64().is_some_and(|p| (0.0..=1.0).contains(&p)),
                FieldKind::Boolean => v.is_boolean(),
                FieldKind::Datetime => v
                    .as_str()
                    .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            };
            if !ok {
                return Err(ConsistencyError::Schema(format!(
                    "{}: field '{}' is not a valid {:?}: {}",
                    self.name, field.name, field.kind, v
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_schema_validation() {
        let schema = ResponseSchema::probability();
        assert!(schema.validate(&json!({"prob": 0.3})).is_ok());
        assert!(schema.validate(&json!({"prob": 1.3})).is_err());
        assert!(schema.validate(&json!({"prob": "high"})).is_err());
        assert!(schema.validate(&json!({"reasoning": "x"})).is_err());
        assert!(schema.validate(&json!([0.3])).is_err());
    }

    #[test]
    fn test_optional_fields() {
        let schema = ResponseSchema::dated_question();
        assert!(schema.validate(&json!({"title": "t", "body": "b"})).is_ok());
        assert!(schema
            .validate(&json!({"title": "t", "body": "b", "resolution_date": "2027-01-01T00:00:00Z"}))
            .is_ok());
        assert!(schema
            .validate(&json!({"title": "t", "body": "b", "resolution_date": "next year"}))
            .is_err());
    }

    #[test]
    fn test_descriptor_is_stable() {
        assert_eq!(
            ResponseSchema::question().descriptor(),
            ResponseSchema::question().descriptor()
        );
        assert_ne!(
            ResponseSchema::question().descriptor(),
            ResponseSchema::dated_question().descriptor()
        );
    }
}
