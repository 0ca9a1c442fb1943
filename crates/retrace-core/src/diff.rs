// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural diff engine for nested state trees.
//!
//! [`compute_diff`] walks two serialized trees simultaneously:
//! - objects: key set difference for added/removed, recursion on shared keys;
//! - arrays: element-wise comparison up to the shared length, then an
//!   added/removed tail plus a synthetic `<path>.length` changed entry;
//! - scalars: direct equality.
//!
//! List comparison is positional rather than LCS-based. State lists (message
//! histories, tool results) are append-only in practice, and the positional
//! walk is O(n) where LCS would be O(m·n).
//!
//! [`apply_diff`] is the inverse used by replay: removals first (in reverse,
//! so list indices stay valid), then additions, then changes. Missing paths
//! during removal are ignored, which keeps replay well-defined when a diff
//! was computed with ignore keys the base tree still contains.

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};

use crate::model::{AddedEntry, ChangedEntry, RemovedEntry, StateDiff};

/// Compute a structural diff between two state trees.
///
/// `ignore_keys` excludes top-level object keys (depth 0 only) from the
/// comparison; nested occurrences of the same names still participate.
pub fn compute_diff(before: &Value, after: &Value, ignore_keys: &HashSet<String>) -> StateDiff {
    let mut diff = StateDiff::default();
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            diff_maps(b, a, "", &mut diff, ignore_keys);
        }
        _ => diff_values(before, after, "", &mut diff, ignore_keys),
    }
    diff
}

/// Compare two objects key by key, in lexicographic key order.
fn diff_maps(
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    path: &str,
    diff: &mut StateDiff,
    ignore_keys: &HashSet<String>,
) {
    let ignored = |key: &str| path.is_empty() && ignore_keys.contains(key);

    let before_keys: BTreeSet<&String> =
        before.keys().filter(|k| !ignored(k)).collect();
    let after_keys: BTreeSet<&String> =
        after.keys().filter(|k| !ignored(k)).collect();

    for key in after_keys.difference(&before_keys) {
        diff.added.push(AddedEntry {
            path: join_path(path, key),
            value: after[key.as_str()].clone(),
        });
    }

    for key in before_keys.difference(&after_keys) {
        diff.removed.push(RemovedEntry {
            path: join_path(path, key),
            value: before[key.as_str()].clone(),
        });
    }

    for key in before_keys.intersection(&after_keys) {
        let child_path = join_path(path, key);
        diff_values(
            &before[key.as_str()],
            &after[key.as_str()],
            &child_path,
            diff,
            ignore_keys,
        );
    }
}

/// Compare two values, dispatching on their shapes.
fn diff_values(
    before: &Value,
    after: &Value,
    path: &str,
    diff: &mut StateDiff,
    ignore_keys: &HashSet<String>,
) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => diff_maps(b, a, path, diff, ignore_keys),
        (Value::Array(b), Value::Array(a)) => diff_lists(b, a, path, diff, ignore_keys),
        _ => {
            if before != after {
                diff.changed.push(ChangedEntry {
                    path: path.to_string(),
                    old_value: before.clone(),
                    new_value: after.clone(),
                });
            }
        }
    }
}

/// Compare two arrays positionally.
fn diff_lists(
    before: &[Value],
    after: &[Value],
    path: &str,
    diff: &mut StateDiff,
    ignore_keys: &HashSet<String>,
) {
    let min_len = before.len().min(after.len());

    for i in 0..min_len {
        let item_path = format!("{path}[{i}]");
        diff_values(&before[i], &after[i], &item_path, diff, ignore_keys);
    }

    for (i, item) in after.iter().enumerate().skip(min_len) {
        diff.added.push(AddedEntry {
            path: format!("{path}[{i}]"),
            value: item.clone(),
        });
    }

    for (i, item) in before.iter().enumerate().skip(min_len) {
        diff.removed.push(RemovedEntry {
            path: format!("{path}[{i}]"),
            value: item.clone(),
        });
    }

    if before.len() != after.len() {
        diff.changed.push(ChangedEntry {
            path: format!("{path}.length"),
            old_value: Value::from(before.len() as u64),
            new_value: Value::from(after.len() as u64),
        });
    }
}

/// Build a dotted path string.
fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Apply a diff to a base tree, producing the target tree.
///
/// The base is not mutated. Synthetic `*.length` changed entries are
/// skipped; the list was already resized by the add/remove entries.
pub fn apply_diff(base: &Value, diff: &StateDiff) -> Value {
    let mut result = base.clone();

    for entry in diff.removed.iter().rev() {
        delete_at_path(&mut result, &entry.path);
    }

    for entry in &diff.added {
        set_at_path(&mut result, &entry.path, entry.value.clone());
    }

    for entry in &diff.changed {
        if entry.path.ends_with(".length") {
            continue;
        }
        set_at_path(&mut result, &entry.path, entry.new_value.clone());
    }

    result
}

/// One component of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Object key.
    Key(String),
    /// Array index.
    Index(usize),
}

/// Parse `"foo.bar[2].baz"` into `[Key(foo), Key(bar), Index(2), Key(baz)]`.
///
/// Bracket contents that are not valid indices are treated as keys so the
/// parser stays total; such paths simply fail to match during application.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut index = String::new();
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    index.push(inner);
                }
                match index.parse::<usize>() {
                    Ok(i) => segments.push(Segment::Index(i)),
                    Err(_) => segments.push(Segment::Key(index)),
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    segments
}

/// Set a value at a path, creating intermediate containers as needed.
///
/// Intermediate object keys are created empty; intermediate array slots are
/// filled with empty objects, and the final array slot is null-filled up to
/// the target index.
fn set_at_path(root: &mut Value, path: &str, value: Value) {
    let segments = parse_path(path);
    if segments.is_empty() {
        return;
    }

    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        match segment {
            Segment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                // Descend, inserting an empty object when the key is new.
                let map = match current.as_object_mut() {
                    Some(map) => map,
                    None => return,
                };
                current = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Segment::Index(i) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let items = match current.as_array_mut() {
                    Some(items) => items,
                    None => return,
                };
                while items.len() <= *i {
                    items.push(Value::Object(Map::new()));
                }
                current = &mut items[*i];
            }
        }
    }

    match &segments[segments.len() - 1] {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            if let Some(map) = current.as_object_mut() {
                map.insert(key.clone(), value);
            }
        }
        Segment::Index(i) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            if let Some(items) = current.as_array_mut() {
                while items.len() <= *i {
                    items.push(Value::Null);
                }
                items[*i] = value;
            }
        }
    }
}

/// Delete the value at a path. Missing paths are ignored.
fn delete_at_path(root: &mut Value, path: &str) {
    let segments = parse_path(path);
    if segments.is_empty() {
        return;
    }

    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let next = match segment {
            Segment::Key(key) => current.get_mut(key.as_str()),
            Segment::Index(i) => current.get_mut(*i),
        };
        match next {
            Some(value) => current = value,
            None => return,
        }
    }

    match &segments[segments.len() - 1] {
        Segment::Key(key) => {
            if let Some(map) = current.as_object_mut() {
                map.remove(key.as_str());
            }
        }
        Segment::Index(i) => {
            if let Some(items) = current.as_array_mut()
                && *i < items.len()
            {
                items.remove(*i);
            }
        }
    }
}
