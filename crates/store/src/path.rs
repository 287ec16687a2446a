//! Dotted field-path helpers for flattened documents.
//!
//! The production schema stores per-model usage at paths like
//! `model_usage.claude-opus-4.input_tokens` rather than as a nested object
//! keyed by model name, so that the increment operation for a model never
//! has to read-modify-write a sibling model's counters. This module
//! implements that convention directly on `serde_json::Value`.

use serde_json::{Map, Value};

/// Increment the numeric field at `path` (dot-separated) within `doc` by
/// `delta`, creating intermediate objects and initializing missing leaves to
/// zero. `doc` must already be (or become) a JSON object.
pub fn increment_path(doc: &mut Value, path: &str, delta: f64) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut cursor = doc.as_object_mut().expect("doc coerced to object above");
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        if is_last {
            let current = cursor
                .get(*segment)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let updated = current + delta;
            cursor.insert((*segment).to_string(), numeric_value(updated));
        } else {
            let entry = cursor
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            cursor = entry.as_object_mut().expect("just ensured object");
        }
    }
}

/// Represent a counter as an integer when it has no fractional part (token
/// counts, request counts), otherwise as a float (costs, points when rounded
/// client-side). Keeps the on-disk schema readable.
fn numeric_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < (i64::MAX as f64) {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

/// Shallow merge: every top-level key in `patch` overwrites the
/// corresponding key in `doc` (Firestore `MergeAll` semantics — not a deep
/// merge). Missing keys in `doc` are created.
pub fn merge_all(doc: &mut Value, patch: &Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Some(patch_obj) = patch.as_object() else {
        return;
    };
    let cursor = doc.as_object_mut().expect("doc coerced to object above");
    for (k, v) in patch_obj {
        cursor.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn increment_creates_nested_path() {
        let mut doc = json!({});
        increment_path(&mut doc, "model_usage.claude-opus-4.request_count", 1.0);
        assert_eq!(doc["model_usage"]["claude-opus-4"]["request_count"], 1);
    }

    #[test]
    fn increment_accumulates() {
        let mut doc = json!({"total_requests": 5});
        increment_path(&mut doc, "total_requests", 1.0);
        increment_path(&mut doc, "total_requests", 1.0);
        assert_eq!(doc["total_requests"], 7);
    }

    #[test]
    fn increment_does_not_disturb_sibling_models() {
        let mut doc = json!({"model_usage": {"haiku": {"request_count": 3}}});
        increment_path(&mut doc, "model_usage.opus.request_count", 1.0);
        assert_eq!(doc["model_usage"]["haiku"]["request_count"], 3);
        assert_eq!(doc["model_usage"]["opus"]["request_count"], 1);
    }

    #[test]
    fn increment_float_preserves_fraction() {
        let mut doc = json!({});
        increment_path(&mut doc, "total_cost", 0.0031);
        assert!((doc["total_cost"].as_f64().unwrap() - 0.0031).abs() < 1e-9);
    }

    #[test]
    fn merge_all_overwrites_top_level_only() {
        let mut doc = json!({"a": 1, "nested": {"x": 1}});
        merge_all(&mut doc, &json!({"a": 2, "nested": {"y": 2}}));
        assert_eq!(doc["a"], 2);
        // MergeAll replaces the whole "nested" value, it does not deep merge.
        assert_eq!(doc["nested"], json!({"y": 2}));
    }
}
