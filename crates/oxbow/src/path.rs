//! Dotted-path access on JSON documents.
//!
//! Field mappings and `$set`/`$unset` specs address fields with dotted
//! paths like `"user.address.city"`. A path can resolve two ways: as a
//! literal key (update specs store `{"a.b": 1}` under the literal key
//! `"a.b"`) or by descending nested objects. Literal keys win, which
//! keeps update-spec keys and materialized documents interchangeable.

use serde_json::{Map, Value};

/// Read the value at `path`, literal key first, then nested descent.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let obj = doc.as_object()?;
    if let Some(v) = obj.get(path) {
        return Some(v);
    }
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Whether `path` resolves to any value, including `null`.
pub fn has_path(doc: &Value, path: &str) -> bool {
    get_path(doc, path).is_some()
}

/// Write `value` at `path`.
///
/// If the document already holds `path` as a literal key it is
/// overwritten in place; otherwise intermediate objects are created
/// along the dotted segments, replacing non-object values on the way.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    if let Some(obj) = doc.as_object_mut() {
        if obj.contains_key(path) {
            obj.insert(path.to_string(), value);
            return;
        }
    }
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let obj = match current.as_object_mut() {
            Some(obj) => obj,
            None => return,
        };
        if i == segments.len() - 1 {
            obj.insert(segment.to_string(), value);
            return;
        }
        let entry = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
}

/// Remove the value at `path`, literal key first, then nested descent.
/// Missing paths are a no-op. Returns whether anything was removed.
pub fn unset_path(doc: &mut Value, path: &str) -> bool {
    let Some(obj) = doc.as_object_mut() else {
        return false;
    };
    if obj.remove(path).is_some() {
        return true;
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for (i, segment) in segments.iter().enumerate() {
        let Some(obj) = current.as_object_mut() else {
            return false;
        };
        if i == segments.len() - 1 {
            return obj.remove(*segment).is_some();
        }
        match obj.get_mut(*segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested() {
        let doc = json!({"a": {"b": {"c": 1}}});
        assert_eq!(get_path(&doc, "a.b.c"), Some(&json!(1)));
        assert_eq!(get_path(&doc, "a.b"), Some(&json!({"c": 1})));
        assert_eq!(get_path(&doc, "a.x"), None);
    }

    #[test]
    fn test_get_literal_key_wins() {
        let doc = json!({"a.b": 1, "a": {"b": 2}});
        assert_eq!(get_path(&doc, "a.b"), Some(&json!(1)));
    }

    #[test]
    fn test_has_path_on_update_spec_keys() {
        // $set specs keep dotted paths as literal keys
        let set = json!({"field0.field1": "x"});
        assert!(has_path(&set, "field0.field1"));
        assert!(!has_path(&set, "field0"));
        assert!(!has_path(&set, "field0.field1.deeper"));
    }

    #[test]
    fn test_has_path_null_counts() {
        let doc = json!({"a": null});
        assert!(has_path(&doc, "a"));
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = json!({});
        set_path(&mut doc, "a.b.c", json!(5));
        assert_eq!(doc, json!({"a": {"b": {"c": 5}}}));
    }

    #[test]
    fn test_set_overwrites_literal_key() {
        let mut doc = json!({"a.b": 1});
        set_path(&mut doc, "a.b", json!(2));
        assert_eq!(doc, json!({"a.b": 2}));
    }

    #[test]
    fn test_set_replaces_scalar_on_path() {
        let mut doc = json!({"a": 1});
        set_path(&mut doc, "a.b", json!(2));
        assert_eq!(doc, json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_unset_nested() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        assert!(unset_path(&mut doc, "a.b"));
        assert_eq!(doc, json!({"a": {"c": 2}}));
        assert!(!unset_path(&mut doc, "a.b"));
    }

    #[test]
    fn test_unset_literal_key() {
        let mut doc = json!({"a.b": 1, "a": {"b": 2}});
        assert!(unset_path(&mut doc, "a.b"));
        assert_eq!(doc, json!({"a": {"b": 2}}));
    }
}
