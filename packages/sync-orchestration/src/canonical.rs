//! Deterministic JSON canonicalization and normalized diffing (spec §4.1.a,
//! §9 "Diff normalization requires deterministic JSON").
//!
//! `serde_json::Value`'s own `Serialize` impl does not sort object keys, so
//! two logically-identical records can serialize to different byte
//! strings. Everything that hashes or deep-compares a record in this crate
//! goes through [`canonicalize`] first.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

/// Recursively normalizes a JSON value: drops `null`/would-be-`undefined`
/// fields are left as `Null` (there is no `undefined` in `serde_json`, so
/// this step is a no-op on the Rust side beyond NaN handling), sorts object
/// keys, and leaves arrays in-order.
///
/// Function-valued fields and `Date`/`Map` coercions from the spec's
/// JavaScript-flavored description don't apply to `serde_json::Value`
/// (there are no function values, and `chrono::DateTime` fields are
/// already serialized to RFC3339 strings by the time they reach this
/// layer); this canonicalizer implements the parts of §4.1.a that are
/// representable in JSON: sorted keys and NaN-to-null.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.is_nan() {
                    return Value::Null;
                }
            }
            value.clone()
        }
        other => other.clone(),
    }
}

/// Serializes a canonicalized value to a string with sorted keys, suitable
/// for hashing. Idempotent: `canonical_json(canonicalize(v)) ==
/// canonical_json(canonicalize(canonicalize(v)))`.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// Drops ignored top-level fields and canonicalizes what remains — the
/// "prepare" step of §4.1.a.
pub fn prepare(value: &Value, ignore: &HashSet<&str>) -> Value {
    let canon = canonicalize(value);
    match canon {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if !ignore.contains(k.as_str()) {
                    out.insert(k, v);
                }
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Standard ignore sets (spec §4.1.a).
pub fn entity_ignore_fields() -> HashSet<&'static str> {
    [
        "created",
        "firstSeenAt",
        "lastSeenAt",
        "lastIndexed",
        "lastAnalyzed",
        "lastValidated",
        "snapshotCreated",
        "snapshotTakenAt",
        "timestamp",
    ]
    .into_iter()
    .collect()
}

pub fn relationship_ignore_fields() -> HashSet<&'static str> {
    [
        "created",
        "firstSeenAt",
        "lastSeenAt",
        "version",
        "occurrencesScan",
        "occurrencesTotal",
    ]
    .into_iter()
    .collect()
}

/// A single differing field, keyed by dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub current: Value,
    pub incoming: Value,
}

/// Deep key-union walk producing dotted-path diff entries. Values are
/// compared after canonicalization, so key order never causes spurious
/// diffs.
pub fn diff(current: &Value, incoming: &Value) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    diff_into("", current, incoming, &mut entries);
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn diff_into(prefix: &str, current: &Value, incoming: &Value, out: &mut Vec<DiffEntry>) {
    match (current, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                let av = a.get(key).cloned().unwrap_or(Value::Null);
                let bv = b.get(key).cloned().unwrap_or(Value::Null);
                diff_into(&path, &av, &bv, out);
            }
        }
        _ => {
            let ca = canonicalize(current);
            let cb = canonicalize(incoming);
            if ca != cb {
                out.push(DiffEntry {
                    path: prefix.to_string(),
                    current: ca,
                    incoming: cb,
                });
            }
        }
    }
}

/// Canonical, sorted representation of a diff suitable for hashing
/// (`sortedDiffEntries` in spec §4.1.b).
pub fn sorted_diff_entries_string(entries: &[DiffEntry]) -> String {
    let mut parts: Vec<String> = entries
        .iter()
        .map(|e| {
            format!(
                "{}={}|{}",
                e.path,
                canonical_json(&e.current),
                canonical_json(&e.incoming)
            )
        })
        .collect();
    parts.sort();
    parts.join(";")
}
