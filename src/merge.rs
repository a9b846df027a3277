use serde_json::{Map, Value};

/// Shallow last-writer-wins merge of a delta over a base document. Every
/// top-level key in `delta` replaces the corresponding key in `base`;
/// nested objects are replaced wholesale, not merged.
pub fn merge_delta(base: &Value, delta: &Value) -> Value {
    let Some(delta_map) = delta.as_object() else {
        return delta.clone();
    };
    let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    for (k, v) in delta_map {
        merged.insert(k.clone(), v.clone());
    }
    Value::Object(merged)
}

/// Build the delta that restores the fields named in `shadow` to their
/// values in `source`. Fields absent from `source` come back as null; a
/// JSON envelope has no way to unset a key.
pub fn extract_keys(source: &Value, shadow: &Value) -> Value {
    let mut out = Map::new();
    if let Some(keys) = shadow.as_object() {
        for k in keys.keys() {
            let v = source.get(k).cloned().unwrap_or(Value::Null);
            out.insert(k.clone(), v);
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::{extract_keys, merge_delta};
    use serde_json::json;

    #[test]
    fn merge_is_shallow_and_delta_wins() {
        let base = json!({"title": "a", "status": "open", "meta": {"x": 1}});
        let delta = json!({"title": "b", "meta": {"y": 2}});
        assert_eq!(
            merge_delta(&base, &delta),
            json!({"title": "b", "status": "open", "meta": {"y": 2}})
        );
    }

    #[test]
    fn merge_over_missing_base_yields_delta() {
        assert_eq!(merge_delta(&json!(null), &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn extract_keys_restores_shadowed_fields() {
        let authoritative = json!({"title": "server", "status": "done"});
        let delta = json!({"title": "local"});
        assert_eq!(
            extract_keys(&authoritative, &delta),
            json!({"title": "server"})
        );
    }

    #[test]
    fn extract_keys_nulls_fields_absent_from_source() {
        let authoritative = json!({"status": "done"});
        let delta = json!({"title": "local"});
        assert_eq!(extract_keys(&authoritative, &delta), json!({"title": null}));
    }
}
