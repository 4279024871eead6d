//! Settings merger
//!
//! Layers JSON overrides over typed defaults: defaults < environment < stored.
//! Each layer replaces whole top-level fields. Layers that fail to parse are
//! logged and skipped, and any field whose merged value no longer fits the
//! settings type (an unknown model id, a string where a bool belongs) is reset
//! to the default value for that field.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// One parsed override layer
pub type Overrides = Map<String, Value>;

/// Parse a raw JSON override, logging and discarding anything that is not an object
pub fn parse_override(raw: &str, source: &str) -> Option<Overrides> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(other) => {
            tracing::error!(
                "Error parsing {}: expected a JSON object, got {}",
                source,
                json_kind(&other)
            );
            None
        }
        Err(e) => {
            tracing::error!("Error parsing {}: {}", source, e);
            None
        }
    }
}

/// Convert an already-decoded JSON value into an override layer
pub fn value_to_override(value: Value, source: &str) -> Option<Overrides> {
    match value {
        Value::Object(map) => Some(map),
        other => {
            tracing::error!(
                "Ignoring {}: expected a JSON object, got {}",
                source,
                json_kind(&other)
            );
            None
        }
    }
}

/// Merge `defaults < env < stored`
///
/// Absent layers are no-ops, so `merge_settings(d, None, s) == merge_settings(d, s, None)`.
pub fn merge_settings<T>(defaults: &T, env: Option<&Overrides>, stored: Option<&Overrides>) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    let mut merged = defaults.clone();
    for layer in [env, stored].into_iter().flatten() {
        merged = apply_layer(defaults, &merged, layer);
    }
    merged
}

/// Apply one override layer on top of `base`
///
/// Fields that would make the result undeserializable are reset to the value
/// they have in `defaults`.
pub fn apply_layer<T>(defaults: &T, base: &T, layer: &Overrides) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    let (Some(default_map), Some(base_map)) = (to_object(defaults), to_object(base)) else {
        tracing::error!("Settings type does not serialize to a JSON object; ignoring overrides");
        return base.clone();
    };

    let mut merged = base_map.clone();
    for (key, value) in layer {
        merged.insert(key.clone(), value.clone());
    }
    if let Ok(settings) = serde_json::from_value::<T>(Value::Object(merged)) {
        return settings;
    }

    // Slow path: admit fields one at a time so a single bad field cannot
    // discard the rest of the layer.
    let mut current = base_map;
    for (key, value) in layer {
        let mut candidate = current.clone();
        candidate.insert(key.clone(), value.clone());
        if serde_json::from_value::<T>(Value::Object(candidate.clone())).is_ok() {
            current = candidate;
            continue;
        }

        tracing::warn!(
            "Invalid value {} for settings field `{}`; resetting to default",
            value,
            key
        );
        match default_map.get(key) {
            Some(default_value) => {
                current.insert(key.clone(), default_value.clone());
            }
            None => {
                current.remove(key);
            }
        }
    }

    serde_json::from_value::<T>(Value::Object(current)).unwrap_or_else(|e| {
        tracing::error!("Merged settings still invalid ({}); keeping previous", e);
        base.clone()
    })
}

fn to_object<T: Serialize>(settings: &T) -> Option<Overrides> {
    match serde_json::to_value(settings) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
