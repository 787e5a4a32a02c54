//! Flatten/merge codec
//!
//! Converts between nested settings objects and the flat key-path namespace
//! of the backing store. Nested field names are joined with
//! [`KEY_SEPARATOR`] (`.`); schema field names never contain it, so literal
//! keys colliding with nested paths are not handled.
//!
//! Sequences, empty objects and tagged-union entries (objects carrying the
//! [`UNION_TAG`] discriminant) are leaves: they are stored under one key and
//! replaced as whole units when merged.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::constants::codec::{KEY_SEPARATOR, UNION_TAG};

/// Flat key path → value. Ordered, so ancestors sort before descendants and
/// identical content always serializes to identical bytes.
pub type FlatMap = BTreeMap<String, Value>;

fn is_union(object: &Map<String, Value>) -> bool {
    object.contains_key(UNION_TAG)
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{KEY_SEPARATOR}{key}")
    }
}

/// Flatten a nested object into dotted key paths
pub fn flatten(root: &Map<String, Value>) -> FlatMap {
    let mut out = FlatMap::new();
    for (key, value) in root {
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut FlatMap) {
    match value {
        Value::Object(object) if !object.is_empty() && !is_union(object) => {
            for (key, child) in object {
                flatten_into(&join(prefix, key), child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}

/// Rebuild a nested object from dotted key paths.
///
/// Keys are applied in order and merged, so a file holding both a whole
/// object under `a` and a leaf under `a.b` yields `a` with `b` overlaid.
pub fn unflatten(flat: &FlatMap) -> Map<String, Value> {
    let mut root = Value::Object(Map::new());
    for (key, value) in flat {
        if key.is_empty() {
            continue;
        }
        let nested = key
            .rsplit(KEY_SEPARATOR)
            .fold(value.clone(), |inner, part| {
                let mut wrapper = Map::new();
                wrapper.insert(part.to_string(), inner);
                Value::Object(wrapper)
            });
        merge_in_place(&mut root, nested);
    }
    match root {
        Value::Object(object) => object,
        _ => Map::new(),
    }
}

/// Overlay wins per field, recursing into nested objects. Sequences and
/// tagged-union entries from the overlay replace the base value whole.
///
/// The result shares nothing with either input, so callers can roll back by
/// discarding it and keeping `base`.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    let mut merged = base.clone();
    merge_in_place(&mut merged, overlay.clone());
    merged
}

fn merge_in_place(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) if !is_union(&overlay_obj) => {
            for (key, overlay_value) in overlay_obj {
                match base_obj.get_mut(&key) {
                    Some(base_value) => merge_in_place(base_value, overlay_value),
                    None => {
                        base_obj.insert(key, overlay_value);
                    }
                }
            }
        }
        (slot, overlay_value) => *slot = overlay_value,
    }
}

/// Look up the value at a dotted path
pub fn value_at<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split(KEY_SEPARATOR)
        .try_fold(root, |current, part| current.get(part))
}

/// Replace the value at a dotted path, creating intermediate objects.
/// Unlike [`deep_merge`], nothing from the previous value survives.
pub fn replace_at(root: &mut Map<String, Value>, key: &str, value: Value) {
    let mut parts = key.split(KEY_SEPARATOR).peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(next) => current = next,
            _ => return,
        }
    }
}

/// True if `key` lies strictly below `ancestor` in the key-path namespace
pub fn is_descendant(key: &str, ancestor: &str) -> bool {
    key.len() > ancestor.len()
        && key.starts_with(ancestor)
        && key[ancestor.len()..].starts_with(KEY_SEPARATOR)
}
