// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payload sanitisation for values crossing the process boundary.
//!
//! Payloads arrive as JSON trees; host bindings encode rich native types
//! (maps, sets, dates, errors, and the rest) into the tagged forms below
//! before handing them over. The sanitiser itself only has to bound the
//! tree: anything nested past the configured depth is replaced with a
//! marker string naming the offending path. Sanitisation is idempotent —
//! a sanitised tree passes through unchanged.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

/// Depth bound for outbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeOptions {
    pub max_depth: usize,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

/// Bound a payload tree to the configured depth.
///
/// Containers at the bound are replaced with `"[Max Depth Exceeded: <path>]"`;
/// scalars pass through at any depth.
pub fn sanitize(value: &Value, opts: &SanitizeOptions) -> Value {
    let mut path = Vec::new();
    walk(value, 0, &mut path, opts)
}

fn walk(value: &Value, depth: usize, path: &mut Vec<String>, opts: &SanitizeOptions) -> Value {
    match value {
        Value::Object(map) => {
            if depth >= opts.max_depth {
                return Value::String(format!("[Max Depth Exceeded: {}]", path.join(".")));
            }
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                path.push(key.clone());
                out.insert(key.clone(), walk(child, depth + 1, path, opts));
                path.pop();
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth >= opts.max_depth {
                return Value::String(format!("[Max Depth Exceeded: {}]", path.join(".")));
            }
            let mut out = Vec::with_capacity(items.len());
            for (idx, child) in items.iter().enumerate() {
                path.push(idx.to_string());
                out.push(walk(child, depth + 1, path, opts));
                path.pop();
            }
            Value::Array(out)
        }
        scalar => scalar.clone(),
    }
}

/// Encode a native map as `{ "__type": "Map", "entries": [[k, v], …] }`.
pub fn map_value<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (Value, Value)>,
{
    let entries: Vec<Value> = entries.into_iter().map(|(k, v)| json!([k, v])).collect();
    json!({ "__type": "Map", "entries": entries })
}

/// Encode a native set as `{ "__type": "Set", "values": […] }`.
pub fn set_value<I>(values: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    let values: Vec<Value> = values.into_iter().collect();
    json!({ "__type": "Set", "values": values })
}

/// Encode a regular expression as `"[RegExp: /pattern/flags]"`.
pub fn regexp_value(pattern: &str, flags: &str) -> Value {
    Value::String(format!("[RegExp: /{pattern}/{flags}]"))
}

/// Encode a big integer as its decimal digits with an `n` suffix.
pub fn bigint_value(digits: i128) -> Value {
    Value::String(format!("{digits}n"))
}

/// Encode a symbol as `"[Symbol: description]"`.
pub fn symbol_value(description: &str) -> Value {
    Value::String(format!("[Symbol: {description}]"))
}

/// Encode a timestamp as an ISO-8601 string.
pub fn date_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Encode a float, mapping non-finite values to their name strings
/// (JSON numbers cannot carry them).
pub fn float_value(f: f64) -> Value {
    if f.is_nan() {
        Value::String("NaN".to_owned())
    } else if f.is_infinite() {
        Value::String(if f > 0.0 { "Infinity" } else { "-Infinity" }.to_owned())
    } else {
        json!(f)
    }
}

/// Marker for a cycle detected by the host binding.
pub fn circular_value() -> Value {
    Value::String("[Circular Reference]".to_owned())
}

/// Marker for a property whose getter threw during extraction.
pub fn inaccessible_value(message: &str) -> Value {
    Value::String(format!("[Error accessing property: {message}]"))
}

/// Encode a host error as a plain object with a capture timestamp.
pub fn error_value(
    name: &str,
    message: &str,
    stack: Option<&str>,
    context: Option<Value>,
) -> Value {
    json!({
        "name": name,
        "message": message,
        "stack": stack,
        "timestamp": date_value(Utc::now()),
        "context": context,
    })
}

#[cfg(test)]
#[path = "sanitize_tests.rs"]
mod tests;
