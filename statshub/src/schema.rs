//! Metric-shard schema validation.
//!
//! The schema is a configuration-supplied JSON document mapping field
//! names to type names (`"string"`, `"boolean"`, `"number"`, `"bigint"`),
//! with nested objects and arrays of type names allowed. The document's
//! shape is checked once at startup; inbound metric shards are then
//! validated value-by-value against it.

use serde_json::Value;
use std::path::Path;

use crate::error::{HubError, Result};

const TYPE_NAMES: [&str; 4] = ["string", "boolean", "number", "bigint"];

fn is_type_name(name: &str) -> bool {
    TYPE_NAMES.contains(&name)
}

fn valid_entry(entry: &Value) -> bool {
    match entry {
        Value::String(name) => is_type_name(name),
        Value::Object(fields) => fields.values().all(valid_entry),
        Value::Array(options) => options.iter().all(valid_entry),
        _ => false,
    }
}

/// Validate the shape of a schema document. The root must be an object;
/// every entry must bottom out in a known type name.
pub fn validate_document(schema: &Value) -> Result<()> {
    let root = match schema {
        Value::Array(_) => {
            return Err(HubError::Schema(
                "schema cannot have an array as root structure".to_string(),
            ))
        }
        Value::Object(root) => root,
        _ => return Err(HubError::Schema("schema root must be an object".to_string())),
    };

    for (field, entry) in root {
        if !valid_entry(entry) {
            return Err(HubError::Schema(format!("invalid schema entry: {field}")));
        }
    }
    Ok(())
}

/// Load a schema document from a JSON file and check its shape.
pub fn load_document(path: impl AsRef<Path>) -> Result<Value> {
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        HubError::Config(format!("schema file {}: {}", path.as_ref().display(), e))
    })?;
    let schema: Value = serde_json::from_str(&raw)?;
    validate_document(&schema)?;
    Ok(schema)
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        // JSON has no bigint; integers qualify.
        "bigint" => value.is_i64() || value.is_u64(),
        _ => false,
    }
}

fn value_matches(entry: &Value, value: &Value) -> bool {
    match entry {
        Value::String(name) => type_matches(name, value),
        Value::Object(fields) => value.as_object().is_some_and(|obj| {
            obj.iter()
                .all(|(k, v)| fields.get(k).is_some_and(|e| value_matches(e, v)))
        }),
        // Array entry: elements may be any of the listed alternatives.
        Value::Array(options) => value.as_array().is_some_and(|elems| {
            elems
                .iter()
                .all(|elem| options.iter().any(|opt| value_matches(opt, elem)))
        }),
        _ => false,
    }
}

/// Validate an inbound metric shard against the schema document.
///
/// Every top-level field of the shard must exist in the schema and match
/// its declared type; fields declared in the schema but absent from the
/// shard are allowed (clusters report partial views).
pub fn validate_shard(schema: &Value, shard: &Value) -> bool {
    let (Some(schema), Some(shard)) = (schema.as_object(), shard.as_object()) else {
        return false;
    };
    shard
        .iter()
        .all(|(field, value)| schema.get(field).is_some_and(|e| value_matches(e, value)))
}
