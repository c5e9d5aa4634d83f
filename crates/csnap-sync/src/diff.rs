use std::collections::BTreeSet;

use csnap_core::{is_admin_field, ChangeEntry};
use csnap_storage::Document;
use serde_json::{Map, Value as JsonValue};

use crate::config::EntitySpec;

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Dotted paths whose arrays compare by membership.
    pub set_fields: BTreeSet<String>,
}

impl DiffOptions {
    pub fn with_set_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            set_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn for_entity(spec: &EntitySpec) -> Self {
        Self::with_set_fields(spec.set_fields.iter().cloned())
    }
}

/// Field-level differences from `previous` to `next`, sorted by path.
///
/// Administrative fields are ignored at the top level and a missing key equals
/// an explicit `null`. Nested objects recurse with dotted paths (an absent
/// object counts as empty). Arrays are
/// compared whole unless listed in `set_fields`. An empty result means the two
/// documents carry the same content.
pub fn diff(previous: &Document, next: &Document, opts: &DiffOptions) -> Vec<ChangeEntry> {
    let mut out = Vec::new();
    diff_objects("", previous, next, opts, &mut out);
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

fn diff_objects(
    prefix: &str,
    previous: &Map<String, JsonValue>,
    next: &Map<String, JsonValue>,
    opts: &DiffOptions,
    out: &mut Vec<ChangeEntry>,
) {
    let keys: BTreeSet<&String> = previous.keys().chain(next.keys()).collect();
    for key in keys {
        if prefix.is_empty() && is_admin_field(key) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let before = previous.get(key).unwrap_or(&JsonValue::Null);
        let after = next.get(key).unwrap_or(&JsonValue::Null);
        diff_values(path, before, after, opts, out);
    }
}

fn diff_values(
    path: String,
    before: &JsonValue,
    after: &JsonValue,
    opts: &DiffOptions,
    out: &mut Vec<ChangeEntry>,
) {
    let empty = Map::new();
    let same = match (before, after) {
        (JsonValue::Object(a), JsonValue::Object(b)) => {
            diff_objects(&path, a, b, opts, out);
            return;
        }
        (JsonValue::Null, JsonValue::Object(b)) => {
            diff_objects(&path, &empty, b, opts, out);
            return;
        }
        (JsonValue::Object(a), JsonValue::Null) => {
            diff_objects(&path, a, &empty, opts, out);
            return;
        }
        (JsonValue::Array(a), JsonValue::Array(b)) if opts.set_fields.contains(&path) => {
            same_members(a, b)
        }
        _ => values_equal(before, after),
    };
    if !same {
        out.push(ChangeEntry {
            path,
            before: before.clone(),
            after: after.clone(),
        });
    }
}

fn same_members(a: &[JsonValue], b: &[JsonValue]) -> bool {
    a.iter().all(|x| b.iter().any(|y| values_equal(x, y)))
        && b.iter().all(|y| a.iter().any(|x| values_equal(x, y)))
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => numbers_equal(x, y),
        _ => a == b,
    }
}

// Integers compare exactly; a float on either side (what a store may hand
// back) falls back to f64.
fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if x.is_f64() || y.is_f64() {
        return x.as_f64() == y.as_f64();
    }
    match (x.as_i64(), y.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => x.as_u64() == y.as_u64(),
    }
}
