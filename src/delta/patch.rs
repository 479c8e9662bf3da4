//! JSON merge patches (RFC 7386).

use serde_json::{Map, Value};

/// Patch turning `previous` into `current`: removed members become `null`, changed objects
/// recurse, anything else is replaced. Equal documents give `{}`.
pub fn create_merge_patch(previous: &Value, current: &Value) -> Value {
    match (previous, current) {
        (Value::Object(prev), Value::Object(cur)) => Value::Object(object_patch(prev, cur)),
        _ if previous == current => Value::Object(Map::new()),
        _ => current.clone(),
    }
}

fn object_patch(prev: &Map<String, Value>, cur: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for key in prev.keys() {
        if !cur.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in cur {
        match (prev.get(key), value) {
            (None, _) => {
                patch.insert(key.clone(), value.clone());
            }
            (Some(Value::Object(p)), Value::Object(c)) => {
                let inner = object_patch(p, c);
                if !inner.is_empty() {
                    patch.insert(key.clone(), Value::Object(inner));
                }
            }
            (Some(old), _) if old != value => {
                patch.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    patch
}

/// Strips `null` object members at any depth; arrays keep their length.
pub fn remove_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(remove_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(remove_nulls),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply_merge_patch(target: &mut Value, patch: &Value) {
        let Value::Object(patch) = patch else {
            *target = patch.clone();
            return;
        };
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        let Value::Object(map) = target else { return };
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }

    #[test]
    fn equal_documents_give_empty_patch() {
        let doc = json!({ "sshd": { "id": "sshd", "pid": "10" } });
        assert_eq!(create_merge_patch(&doc, &doc), json!({}));
    }

    #[test]
    fn removed_added_and_changed_items() {
        let prev = json!({
            "cron": { "id": "cron", "pid": "11" },
            "sshd": { "id": "sshd", "pid": "10" },
            "ntpd": { "id": "ntpd", "pid": "12" }
        });
        let cur = json!({
            "sshd": { "id": "sshd", "pid": "20" },
            "ntpd": { "id": "ntpd", "pid": "12" },
            "auditd": { "id": "auditd", "pid": "13" }
        });
        let patch = create_merge_patch(&prev, &cur);
        assert_eq!(
            patch,
            json!({
                "cron": null,
                "sshd": { "pid": "20" },
                "auditd": { "id": "auditd", "pid": "13" }
            })
        );

        let mut applied = prev.clone();
        apply_merge_patch(&mut applied, &patch);
        assert_eq!(applied, cur);
    }

    #[test]
    fn type_change_replaces_value() {
        let patch = create_merge_patch(&json!({ "a": { "b": 1 } }), &json!({ "a": [1, 2] }));
        assert_eq!(patch, json!({ "a": [1, 2] }));
    }

    #[test]
    fn nulls_are_removed_recursively() {
        let mut v = json!({ "a": null, "b": { "c": null, "d": 1 }, "e": [{ "f": null }, null] });
        remove_nulls(&mut v);
        assert_eq!(v, json!({ "b": { "d": 1 }, "e": [{}, null] }));
    }
}
