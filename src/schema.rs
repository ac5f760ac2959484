//! Argument validation against tool input schemas
//!
//! Covers the JSON-schema keywords tool descriptors use in practice: `type`,
//! `properties`, `required`, `additionalProperties`, `items`, `enum`, `const`,
//! numeric and length bounds, and the `anyOf`/`oneOf`/`allOf` combinators.
//! Keywords outside that set (`pattern`, `format`, `$ref`, ...) are accepted
//! without being checked.

use serde_json::{Map, Value};

use crate::error::Error;

/// Checks `instance` against `schema`, reporting the first violation found
pub fn validate(schema: &Value, instance: &Value) -> Result<(), Error> {
    check(schema, instance, "$").map_err(Error::Validation)
}

fn check(schema: &Value, instance: &Value, path: &str) -> Result<(), String> {
    let schema = match schema {
        Value::Bool(true) => return Ok(()),
        Value::Bool(false) => return Err(format!("{path}: no value is allowed here")),
        Value::Object(schema) => schema,
        _ => return Ok(()),
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, instance, path)?;
    }
    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(instance) {
            return Err(format!("{path}: {instance} is not one of {}", Value::Array(allowed.clone())));
        }
    }
    if let Some(constant) = schema.get("const") {
        if constant != instance {
            return Err(format!("{path}: expected {constant}, got {instance}"));
        }
    }

    match instance {
        Value::Object(object) => check_object(schema, object, path)?,
        Value::Array(items) => check_array(schema, items, path)?,
        Value::String(s) => check_string(schema, s, path)?,
        Value::Number(n) => {
            if let Some(n) = n.as_f64() {
                check_number(schema, n, path)?;
            }
        }
        _ => {}
    }

    if let Some(Value::Array(all)) = schema.get("allOf") {
        for sub in all {
            check(sub, instance, path)?;
        }
    }
    if let Some(Value::Array(any)) = schema.get("anyOf") {
        if !any.iter().any(|sub| check(sub, instance, path).is_ok()) {
            return Err(format!("{path}: does not match any of the allowed schemas"));
        }
    }
    if let Some(Value::Array(one)) = schema.get("oneOf") {
        let matches = one.iter().filter(|sub| check(sub, instance, path).is_ok()).count();
        if matches != 1 {
            return Err(format!(
                "{path}: must match exactly one schema, matched {matches}"
            ));
        }
    }
    Ok(())
}

fn check_type(expected: &Value, instance: &Value, path: &str) -> Result<(), String> {
    let matches = match expected {
        Value::String(name) => type_matches(name, instance),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_matches(name, instance)),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(format!("{path}: expected type {expected}, got {}", describe(instance)))
    }
}

fn type_matches(name: &str, instance: &Value) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        "number" => instance.is_number(),
        "integer" => match instance {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        _ => true,
    }
}

fn check_object(schema: &Map<String, Value>, object: &Map<String, Value>, path: &str) -> Result<(), String> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(format!("{path}: missing required property '{name}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (name, value) in object {
        let child = format!("{path}.{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(sub) => check(sub, value, &child)?,
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    return Err(format!("{path}: unexpected property '{name}'"))
                }
                Some(sub @ Value::Object(_)) => check(sub, value, &child)?,
                _ => {}
            },
        }
    }
    Ok(())
}

fn check_array(schema: &Map<String, Value>, items: &[Value], path: &str) -> Result<(), String> {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            return Err(format!("{path}: expected at least {min} items, got {}", items.len()));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if items.len() as u64 > max {
            return Err(format!("{path}: expected at most {max} items, got {}", items.len()));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }
    Ok(())
}

fn check_string(schema: &Map<String, Value>, s: &str, path: &str) -> Result<(), String> {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            return Err(format!("{path}: shorter than {min} characters"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            return Err(format!("{path}: longer than {max} characters"));
        }
    }
    Ok(())
}

fn check_number(schema: &Map<String, Value>, n: f64, path: &str) -> Result<(), String> {
    let bound = |key: &str| schema.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum") {
        if n < min {
            return Err(format!("{path}: {n} is less than the minimum {min}"));
        }
    }
    if let Some(max) = bound("maximum") {
        if n > max {
            return Err(format!("{path}: {n} is greater than the maximum {max}"));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if n <= min {
            return Err(format!("{path}: {n} must be greater than {min}"));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if n >= max {
            return Err(format!("{path}: {n} must be less than {max}"));
        }
    }
    Ok(())
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
