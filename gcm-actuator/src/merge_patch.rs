//! JSON merge patches (RFC 7386) computed from two document snapshots.

use serde_json::{Map, Value};

/// Build the merge patch that turns `original` into `modified`.
///
/// Removed object members become `null`. Arrays and scalars are replaced
/// wholesale. Identical documents yield an empty object.
pub fn diff(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            Value::Object(diff_objects(original, modified))
        }
        _ if original == modified => Value::Object(Map::new()),
        _ => modified.clone(),
    }
}

fn diff_objects(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    for (key, new) in modified {
        match original.get(key) {
            Some(old) if old == new => {}
            Some(Value::Object(old)) => {
                if let Value::Object(new) = new {
                    patch.insert(key.clone(), Value::Object(diff_objects(old, new)));
                } else {
                    patch.insert(key.clone(), new.clone());
                }
            }
            _ => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }

    patch
}

/// True when applying `patch` changes nothing.
pub fn is_empty(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_documents() {
        let doc = json!({"a": 1, "b": {"c": [1, 2]}});
        assert!(is_empty(&diff(&doc, &doc)));
    }

    #[test]
    fn test_nested_changes_and_removals() {
        let original = json!({
            "metadata": {"labels": {"keep": "1", "drop": "2"}, "name": "m"},
            "spec": {"providerID": null}
        });
        let modified = json!({
            "metadata": {"labels": {"keep": "1", "new": "3"}, "name": "m"},
            "spec": {"providerID": "gce://p/z/m"}
        });

        assert_eq!(
            diff(&original, &modified),
            json!({
                "metadata": {"labels": {"drop": null, "new": "3"}},
                "spec": {"providerID": "gce://p/z/m"}
            })
        );
    }

    #[test]
    fn test_arrays_are_replaced() {
        let original = json!({"addresses": [{"type": "InternalIP"}]});
        let modified = json!({"addresses": [{"type": "InternalIP"}, {"type": "ExternalIP"}]});
        assert_eq!(diff(&original, &modified), modified);
    }
}
