//! JSON tree access and patch application
//!
//! A link document is a plain `serde_json::Value`. Paths are lists of
//! string segments; the empty path addresses the root and numeric segments
//! index into arrays.

use serde_json::{Map, Value};

use super::change::{ChangeRecord, PatchOp};

/// Value at `path`, or None when any segment is missing.
pub fn get_at<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get(segment.as_str()),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn get_at_mut<'a>(doc: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    path.iter().try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment.as_str()),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

/// Walk to `path`, creating missing intermediate nodes. A segment that
/// indexes just past the end of an array appends a slot; any other segment
/// that cannot descend forces the current node into an object.
fn create_at<'a>(doc: &'a mut Value, path: &[String]) -> &'a mut Value {
    path.iter().fold(doc, |node, segment| {
        let array_index = match node {
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .filter(|i| *i <= items.len()),
            _ => None,
        };
        match array_index {
            Some(i) => {
                let Value::Array(items) = node else {
                    unreachable!()
                };
                if i == items.len() {
                    items.push(Value::Null);
                }
                &mut items[i]
            }
            None => {
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
                let Value::Object(map) = node else {
                    unreachable!()
                };
                map.entry(segment.clone()).or_insert(Value::Null)
            }
        }
    })
}

/// Replace the subtree at `path` with `new_value`.
pub fn set_at(doc: &mut Value, path: &[String], new_value: Value) {
    *create_at(doc, path) = new_value;
}

/// Shallow key-union merge of `source` into the value at `path`, creating
/// it if missing. Returns whether anything changed. A non-object source is
/// rejected before any intermediate nodes are created, so a refused merge
/// leaves the document byte-for-byte untouched.
pub fn update_at(doc: &mut Value, path: &[String], source: Value) -> bool {
    if !source.is_object() {
        log::warn!("update payload is not an object, ignoring: {}", source);
        return false;
    }
    merge_object(create_at(doc, path), source)
}

/// Remove the value at `path`. Returns false (no-op) when it is absent.
pub fn erase_at(doc: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        // Empty path erases the whole document.
        if doc.is_null() {
            return false;
        }
        *doc = Value::Null;
        return true;
    };
    let Some(parent) = get_at_mut(doc, parents) else {
        return false;
    };
    match parent {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

/// Merge `source` into `target`, one level deep: keys absent in the target
/// are added, keys present with a different value are overwritten. There is
/// no recursion past the top level. A non-object target is replaced
/// wholesale; a non-object source is rejected. Returns whether the merge
/// changed anything.
pub fn merge_object(target: &mut Value, source: Value) -> bool {
    let Value::Object(source) = source else {
        log::warn!("update payload is not an object, ignoring: {}", source);
        return false;
    };
    if !target.is_object() {
        *target = Value::Object(source);
        return true;
    }
    let Value::Object(map) = target else {
        unreachable!()
    };
    let mut diff = false;
    for (key, value) in source {
        match map.get_mut(&key) {
            Some(existing) if *existing == value => {}
            Some(existing) => {
                *existing = value;
                diff = true;
            }
            None => {
                map.insert(key, value);
                diff = true;
            }
        }
    }
    diff
}

/// Apply one change record. Returns whether the document changed; Set is
/// always treated as a change.
pub fn apply_record(doc: &mut Value, record: &ChangeRecord) -> bool {
    match record.op {
        PatchOp::Set => {
            set_at(doc, &record.path, record.payload.clone().unwrap_or(Value::Null));
            true
        }
        PatchOp::Update => update_at(
            doc,
            &record.path,
            record.payload.clone().unwrap_or(Value::Null),
        ),
        PatchOp::Erase => erase_at(doc, &record.path),
    }
}

/// Rebuild a document from empty state by folding a change log, which must
/// already be in ascending key order.
pub fn replay(records: &[ChangeRecord]) -> Value {
    let mut doc = Value::Null;
    for record in records {
        apply_record(&mut doc, record);
    }
    doc
}
