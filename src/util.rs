use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::types::Record;

/// Helper: quote identifier (double-quote, escaping inner double-quotes).
pub fn qi(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Helper: quote a text literal for SQL.
pub fn ql(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Key over a fixed column list. Values are written as JSON, so `"1"` and
/// `1` stay distinct and NULL-partitioned key columns compare NULL-equal.
/// Returns `None` when every column is null or missing.
pub fn build_key_for_cols(map: &Record, cols: &[String]) -> Option<String> {
    let mut any_present = false;
    let parts: Vec<String> = cols
        .iter()
        .map(|col| {
            let v = map.get(col).unwrap_or(&Value::Null);
            any_present |= !v.is_null();
            format!("{col}={v}")
        })
        .collect();
    any_present.then(|| parts.join("__"))
}

pub fn json_value_to_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "_NULL_".to_string(),
        other => other.to_string(),
    }
}

/// Compare two JSON maps for equality, treating null values as absent.
pub fn maps_equal_ignoring_nulls(a: &Record, b: &Record) -> bool {
    let subset = |x: &Record, y: &Record| {
        x.iter()
            .filter(|(_, v)| !v.is_null())
            .all(|(k, v)| y.get(k) == Some(v))
    };
    subset(a, b) && subset(b, a)
}

/// Strip null values from a JSON map.
pub fn strip_nulls(map: &Record) -> Record {
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Project `cols` out of `map`, filling missing columns with null.
pub fn project(map: &Record, cols: &[String]) -> Record {
    cols.iter()
        .map(|c| (c.clone(), map.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Hash of a payload with nulls removed. Map iteration order is sorted, so
/// equal payloads hash equally.
pub fn payload_hash(map: &Record) -> u64 {
    let stripped = strip_nulls(map);
    xxh3_64(Value::Object(stripped).to_string().as_bytes())
}

/// Overlay `top` onto `base`.
pub fn overlay(base: &Record, top: &Record) -> Record {
    let mut out = base.clone();
    for (k, v) in top {
        out.insert(k.clone(), v.clone());
    }
    out
}
