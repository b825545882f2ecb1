//! Structured responses
//!
//! A prompt `expecting` a schema gets a JSON-shape instruction appended to its
//! text. The model's reply is scanned for JSON (bare, or inside a single fenced
//! code block) and validated against a JSON Schema derived from the schema
//! definition.

use jsonschema::Validator;
use serde_json::{json, Map, Value};
use thiserror::Error;
use weave_core::{FieldType, SchemaSpec};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("expected one fenced code block, found {0}")]
    MultipleFences(usize),

    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response does not match the schema: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("schema '{name}' could not be compiled: {message}")]
    Compile { name: String, message: String },
}

/// A schema definition compiled for validation.
pub struct CompiledSchema {
    pub name: String,
    shape: Value,
    validator: Validator,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish()
    }
}

impl CompiledSchema {
    pub fn new(spec: &SchemaSpec) -> Result<Self, SchemaError> {
        let schema = json_schema(spec);
        let validator = jsonschema::validator_for(&schema).map_err(|e| SchemaError::Compile {
            name: spec.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name: spec.name.clone(),
            shape: shape(spec),
            validator,
        })
    }

    /// Text appended to a prompt so the model answers in the right shape.
    pub fn instruction(&self) -> String {
        format!(
            "Respond with a single JSON object of this shape (fields marked optional may be omitted):\n{}",
            serde_json::to_string_pretty(&self.shape).unwrap_or_else(|_| self.shape.to_string())
        )
    }

    /// Parse and validate a model reply.
    pub fn parse(&self, text: &str) -> Result<Value, SchemaError> {
        let value = extract_json(text)?;
        self.validate(&value)?;
        Ok(value)
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Invalid(errors))
        }
    }
}

/// JSON Schema for a schema definition. Optional fields may be absent or null.
pub fn json_schema(spec: &SchemaSpec) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in &spec.fields {
        let mut ty = field_schema(&field.ty);
        if field.optional {
            ty = json!({ "anyOf": [ty, { "type": "null" }] });
        } else {
            required.push(Value::String(field.name.clone()));
        }
        properties.insert(field.name.clone(), ty);
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn field_schema(ty: &FieldType) -> Value {
    match ty {
        FieldType::String => json!({ "type": "string" }),
        FieldType::Int => json!({ "type": "integer" }),
        FieldType::Float => json!({ "type": "number" }),
        FieldType::Bool => json!({ "type": "boolean" }),
        FieldType::List(inner) => json!({ "type": "array", "items": field_schema(inner) }),
    }
}

/// Human-readable shape: `{"approved": "bool", "note": "string (optional)"}`.
fn shape(spec: &SchemaSpec) -> Value {
    let mut map = Map::new();
    for field in &spec.fields {
        let ty = if field.optional {
            format!("{} (optional)", field.ty)
        } else {
            field.ty.to_string()
        };
        map.insert(field.name.clone(), Value::String(ty));
    }
    Value::Object(map)
}

/// Pull the JSON value out of a reply. One fenced block is unwrapped; more than
/// one is an error. Without fences the outermost `{...}` or `[...]` is used.
pub fn extract_json(text: &str) -> Result<Value, SchemaError> {
    let fences: Vec<&str> = fenced_blocks(text);
    let candidate = match fences.len() {
        0 => text.trim(),
        1 => fences[0].trim(),
        n => return Err(SchemaError::MultipleFences(n)),
    };

    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(first) => embedded(candidate)
            .and_then(|inner| serde_json::from_str(inner).ok())
            .ok_or_else(|| SchemaError::InvalidJson(first.to_string())),
    }
}

/// Bodies of the ```-fenced blocks in `text`, info strings dropped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(close) = after.find("```") else {
            break;
        };
        let body = &after[..close];
        // skip the info string (`json`) on the opening line
        let body = match body.find('\n') {
            Some(nl) if !body[..nl].trim().contains(['{', '[']) => &body[nl + 1..],
            _ => body,
        };
        blocks.push(body);
        rest = &after[close + 3..];
    }
    blocks
}

fn embedded(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::SchemaField;

    fn review() -> SchemaSpec {
        SchemaSpec {
            name: "Review".to_string(),
            fields: vec![
                SchemaField {
                    name: "approved".to_string(),
                    ty: FieldType::Bool,
                    optional: false,
                },
                SchemaField {
                    name: "severity".to_string(),
                    ty: FieldType::String,
                    optional: false,
                },
                SchemaField {
                    name: "issues".to_string(),
                    ty: FieldType::List(Box::new(FieldType::String)),
                    optional: true,
                },
            ],
        }
    }

    #[test]
    fn test_valid_response() {
        let schema = CompiledSchema::new(&review()).unwrap();
        let value = schema
            .parse(r#"{"approved": true, "severity": "low", "issues": ["nit"]}"#)
            .unwrap();
        assert_eq!(value["severity"], "low");
        assert!(schema.parse(r#"{"approved": false, "severity": "high", "issues": null}"#).is_ok());
    }

    #[test]
    fn test_wrong_types_and_missing_fields() {
        let schema = CompiledSchema::new(&review()).unwrap();
        let err = schema.parse(r#"{"approved": "yes"}"#).unwrap_err();
        let SchemaError::Invalid(errors) = err else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.starts_with("/approved")));
        assert!(errors.iter().any(|e| e.contains("severity")));
    }

    #[test]
    fn test_single_fence_is_unwrapped() {
        let text = "Here you go:\n```json\n{\"approved\": true, \"severity\": \"low\"}\n```\nThanks";
        assert_eq!(extract_json(text).unwrap()["approved"], true);
    }

    #[test]
    fn test_multiple_fences_rejected() {
        let text = "```json\n{\"a\": 1}\n```\nor\n```json\n{\"a\": 2}\n```";
        assert_eq!(extract_json(text), Err(SchemaError::MultipleFences(2)));
    }

    #[test]
    fn test_embedded_object_without_fence() {
        let text = "Sure! {\"approved\": false, \"severity\": \"high\"} Hope this helps.";
        assert_eq!(extract_json(text).unwrap()["severity"], "high");
        assert!(matches!(extract_json("no json here"), Err(SchemaError::InvalidJson(_))));
    }

    #[test]
    fn test_instruction_lists_fields() {
        let schema = CompiledSchema::new(&review()).unwrap();
        let text = schema.instruction();
        assert!(text.contains("\"approved\": \"bool\""));
        assert!(text.contains("\"issues\": \"list[string] (optional)\""));
    }
}
