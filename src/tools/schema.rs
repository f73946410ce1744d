//! JSON-schema subset used to validate tool arguments before execution.
//!
//! Supported keywords: `type` (single or list), `properties`, `required`,
//! `additionalProperties: false`, `enum`, `items`, `minimum`, `maximum`,
//! `minLength`, `maxLength`, `minItems`, `maxItems`, `allOf`, `anyOf`, `oneOf`
//! and local `$ref`s (`#/definitions/...`, `#/$defs/...`) resolved against the
//! root schema. Anything else is ignored, which keeps schemas produced by
//! `schemars` (`$schema`, `title`, `format`, ...) usable as-is.

use serde_json::{Map, Value};

/// First violation found, with a JSON-pointer-like path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

/// How many `$ref` hops one path may take; bounds recursive definitions.
const MAX_REF_DEPTH: usize = 32;

pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaViolation> {
    Validator { root: schema }.check(schema, value, "$", 0)
}

struct Validator<'a> {
    root: &'a Value,
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}

fn type_name(value: &Value) -> &'static str {
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

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

impl Validator<'_> {
    fn check(&self, schema: &Value, value: &Value, path: &str, hops: usize) -> Result<(), SchemaViolation> {
        let Some(schema) = schema.as_object() else {
            // `true` / missing schemas accept everything
            return Ok(());
        };

        if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
            if hops >= MAX_REF_DEPTH {
                return Err(violation(path, format!("`$ref` chain too deep at {reference}")));
            }
            let target = reference
                .strip_prefix('#')
                .and_then(|pointer| self.root.pointer(pointer))
                .ok_or_else(|| violation(path, format!("unresolvable `$ref` {reference}")))?;
            self.check(target, value, path, hops + 1)?;
        }

        if let Some(Value::Array(all)) = schema.get("allOf") {
            for sub in all {
                self.check(sub, value, path, hops)?;
            }
        }
        if let Some(Value::Array(any)) = schema.get("anyOf") {
            let mut first_err = None;
            let matched = any.iter().any(|sub| match self.check(sub, value, path, hops) {
                Ok(()) => true,
                Err(err) => {
                    first_err.get_or_insert(err);
                    false
                }
            });
            if !matched {
                return Err(first_err.unwrap_or_else(|| violation(path, "no `anyOf` alternative")));
            }
        }
        if let Some(Value::Array(one)) = schema.get("oneOf") {
            let matched = one
                .iter()
                .filter(|sub| self.check(sub, value, path, hops).is_ok())
                .count();
            if matched != 1 {
                return Err(violation(
                    path,
                    format!("matches {matched} `oneOf` alternatives, expected exactly one"),
                ));
            }
        }

        if let Some(expected) = schema.get("type") {
            let allowed: Vec<&str> = match expected {
                Value::String(t) => vec![t.as_str()],
                Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
                return Err(violation(
                    path,
                    format!("expected {}, got {}", allowed.join(" or "), type_name(value)),
                ));
            }
        }

        if let Some(Value::Array(options)) = schema.get("enum") {
            if !options.contains(value) {
                return Err(violation(path, format!("{value} is not one of {}", Value::Array(options.clone()))));
            }
        }

        match value {
            Value::Object(obj) => self.check_object(schema, obj, path, hops)?,
            Value::Array(items) => self.check_array(schema, items, path, hops)?,
            Value::String(s) => {
                let len = s.chars().count() as u64;
                if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                    if len < min {
                        return Err(violation(path, format!("shorter than {min} characters")));
                    }
                }
                if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                    if len > max {
                        return Err(violation(path, format!("longer than {max} characters")));
                    }
                }
            }
            Value::Number(n) => {
                let n = n.as_f64().unwrap_or_default();
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                    if n < min {
                        return Err(violation(path, format!("{n} is less than {min}")));
                    }
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                    if n > max {
                        return Err(violation(path, format!("{n} is greater than {max}")));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_object(
        &self,
        schema: &Map<String, Value>,
        obj: &Map<String, Value>,
        path: &str,
        hops: usize,
    ) -> Result<(), SchemaViolation> {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(violation(path, format!("missing required property `{name}`")));
                }
            }
        }
        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));
        for (key, item) in obj {
            let child = format!("{path}.{key}");
            match properties.and_then(|p| p.get(key)) {
                Some(sub) => self.check(sub, item, &child, hops)?,
                None if closed => {
                    return Err(violation(path, format!("unexpected property `{key}`")));
                }
                None => {}
            }
        }
        Ok(())
    }

    fn check_array(
        &self,
        schema: &Map<String, Value>,
        items: &[Value],
        path: &str,
        hops: usize,
    ) -> Result<(), SchemaViolation> {
        let len = items.len() as u64;
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if len < min {
                return Err(violation(path, format!("fewer than {min} items")));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if len > max {
                return Err(violation(path, format!("more than {max} items")));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                self.check(item_schema, item, &format!("{path}[{i}]"), hops)?;
            }
        }
        Ok(())
    }
}
