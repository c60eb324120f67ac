// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reduce an object to the fields a field manager owns before re-applying it.
//!
//! Field ownership uses the `FieldsV1` encoding of server-side apply: `f:<name>`
//! for map keys, `k:<json>` for keyed list items, `v:<json>` for set members and
//! `.` for the element itself.

use crate::error::Result;
use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

/// Fields owned by `manager`, merged across all its managed field entries
pub fn managed_field_set(obj: &DynamicObject, manager: &str) -> Map<String, Value> {
    let mut merged = Map::new();
    for entry in obj.metadata.managed_fields.iter().flatten() {
        if entry.manager.as_deref() != Some(manager) {
            continue;
        }
        if let Some(Value::Object(fields)) = entry.fields_v1.as_ref().map(|f| &f.0) {
            merge_sets(&mut merged, fields);
        }
    }
    merged
}

fn merge_sets(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_sets(existing, incoming),
            _ => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Copy of `obj` holding only its identity and the fields `manager` owns
pub fn prune_unmanaged(obj: &DynamicObject, manager: &str) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj)?;
    let fields = managed_field_set(obj, manager);

    let mut pruned = match prune(&value, &fields) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    for key in ["apiVersion", "kind"] {
        if let Some(v) = value.get(key) {
            pruned.insert(key.to_string(), v.clone());
        }
    }
    let metadata = pruned
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));
    if let Value::Object(meta) = metadata {
        for key in ["name", "namespace"] {
            if let Some(v) = value.pointer(&format!("/metadata/{}", key)) {
                meta.insert(key.to_string(), v.clone());
            }
        }
        meta.remove("managedFields");
    }

    Ok(serde_json::from_value(Value::Object(pruned))?)
}

/// Keep the whole element
fn is_leaf(set: &Map<String, Value>) -> bool {
    set.is_empty() || (set.len() == 1 && set.contains_key("."))
}

fn prune(value: &Value, set: &Map<String, Value>) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                let Some(Value::Object(child_set)) = set.get(&format!("f:{}", key)) else {
                    continue;
                };
                if is_leaf(child_set) {
                    out.insert(key.clone(), child.clone());
                } else if let Some(pruned) = prune(child, child_set) {
                    out.insert(key.clone(), pruned);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| {
                    let (item_set, keys) = list_item_set(item, set)?;
                    if is_leaf(item_set) {
                        return Some(item.clone());
                    }
                    let mut pruned = prune(item, item_set)?;
                    // key fields identify the item and are implied by ownership
                    if let (Value::Object(out), Some(keys)) = (&mut pruned, keys) {
                        out.extend(keys);
                    }
                    Some(pruned)
                })
                .collect(),
        )),
        _ => Some(value.clone()),
    }
}

/// Field set that claims a list item, by set value or by key fields
fn list_item_set<'a>(
    item: &Value,
    set: &'a Map<String, Value>,
) -> Option<(&'a Map<String, Value>, Option<Map<String, Value>>)> {
    set.iter().find_map(|(key, sub)| {
        let sub = sub.as_object()?;
        if let Some(raw) = key.strip_prefix("v:") {
            let expected: Value = serde_json::from_str(raw).ok()?;
            (expected == *item).then_some((sub, None))
        } else if let Some(raw) = key.strip_prefix("k:") {
            let keys: Map<String, Value> = serde_json::from_str(raw).ok()?;
            let matched = keys.iter().all(|(k, v)| item.get(k) == Some(v));
            matched.then_some((sub, Some(keys)))
        } else {
            None
        }
    })
}
