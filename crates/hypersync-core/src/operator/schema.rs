//! Structural schema checks for operator inputs and outputs.
//!
//! Supports the subset of JSON Schema that spec packs use: `type` (single or
//! list), `required`, `properties`, `additionalProperties: false`, `items`,
//! `enum`, `minItems`, `maxItems`. Anything else in a schema is ignored.

use std::fmt;

use serde_json::{Map, Value};

/// A single structural mismatch, located by a `$`-rooted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Check `instance` against `schema`, returning every violation found.
pub fn check(schema: &Value, instance: &Value) -> Vec<SchemaViolation> {
    let mut violations = Vec::new();
    walk(schema, instance, "$", &mut violations);
    violations
}

/// Check a parameter or output map against `schema`.
pub fn check_map(schema: &Value, map: &Map<String, Value>) -> Vec<SchemaViolation> {
    check(schema, &Value::Object(map.clone()))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        // Unknown type names never match, so typos surface as violations.
        _ => false,
    }
}

fn walk(schema: &Value, instance: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    let push = |out: &mut Vec<SchemaViolation>, message: String| {
        out.push(SchemaViolation {
            path: path.to_string(),
            message,
        })
    };

    if let Some(expected) = schema.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.is_empty() && !names.iter().any(|t| type_matches(t, instance)) {
            push(
                out,
                format!("expected {}, found {}", names.join(" | "), kind_of(instance)),
            );
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(instance) {
            push(out, format!("value {instance} is not one of the allowed values"));
        }
    }

    match instance {
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        push(out, format!("missing required field `{name}`"));
                    }
                }
            }

            let properties = schema.get("properties").and_then(Value::as_object);
            if let Some(properties) = properties {
                for (name, sub) in properties {
                    if let Some(value) = map.get(name) {
                        walk(sub, value, &format!("{path}.{name}"), out);
                    }
                }
            }

            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in map.keys() {
                    if !properties.is_some_and(|p| p.contains_key(key)) {
                        push(out, format!("unexpected field `{key}`"));
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if (items.len() as u64) < min {
                    push(out, format!("expected at least {min} items, found {}", items.len()));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if (items.len() as u64) > max {
                    push(out, format!("expected at most {max} items, found {}", items.len()));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    walk(item_schema, item, &format!("{path}[{i}]"), out);
                }
            }
        }
        _ => {}
    }
}
