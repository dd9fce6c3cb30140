//! Argument validation against the JSON-schema subset tools declare.
//!
//! Supported keywords: `type` (a name or a list of names), `required`,
//! `properties`, `items`, `enum`, `additionalProperties: false`. Anything else
//! is accepted as-is. Each violation names the JSON path it was found at.

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for SchemaViolation {}

/// Validate `value` against `schema`, stopping at the first violation.
pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaViolation> {
    validate_at(schema, value, "$")
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    // `true`, `{}` and non-object schemas accept anything
    let Some(schema) = schema.as_object() else {
        return match schema {
            Value::Bool(false) => Err(violation(path, "no value is allowed here")),
            _ => Ok(()),
        };
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, value, path)?;
    }

    if let Some(Value::Array(allowed)) = schema.get("enum")
        && !allowed.contains(value)
    {
        return Err(violation(
            path,
            format!("{} is not one of {}", value, Value::Array(allowed.clone())),
        ));
    }

    match value {
        Value::Object(object) => validate_object(schema, object, path),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{}[{}]", path, index))?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_object(
    schema: &Map<String, Value>,
    object: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaViolation> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(violation(
                    path,
                    format!("missing required property '{}'", field),
                ));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(properties) = properties {
        for (name, property_schema) in properties {
            if let Some(field) = object.get(name) {
                validate_at(property_schema, field, &format!("{}.{}", path, name))?;
            }
        }
    }

    match schema.get("additionalProperties") {
        Some(Value::Bool(false)) => {
            if let Some(extra) = object
                .keys()
                .find(|key| !properties.is_some_and(|p| p.contains_key(*key)))
            {
                return Err(violation(
                    path,
                    format!("unexpected property '{}'", extra),
                ));
            }
        }
        Some(extra_schema @ Value::Object(_)) => {
            for (name, field) in object {
                if !properties.is_some_and(|p| p.contains_key(name)) {
                    validate_at(extra_schema, field, &format!("{}.{}", path, name))?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn check_type(expected: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let names: Vec<&str> = match expected {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };

    if names.is_empty() || names.iter().any(|name| matches_type(name, value)) {
        return Ok(());
    }

    Err(violation(
        path,
        format!("expected {}, found {}", names.join(" or "), type_name(value)),
    ))
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        // Unknown type names constrain nothing
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
