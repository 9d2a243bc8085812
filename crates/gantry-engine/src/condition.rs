//! Pure evaluation of edge conditions against the accumulated results
//! store. Identical (store, condition) inputs always yield the identical
//! boolean — required for state replay after a crash.

use serde_json::{Map, Value};

use gantry_core::types::EdgeCondition;

/// Walk a dot-separated path rooted at a node id, e.g. `"build.report.ok"`
/// resolves `results["build"]["report"]["ok"]`. An unresolvable
/// intermediate yields `None`, never an error.
pub fn resolve_path<'a>(results: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    let mut current = results.get(root)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Standard truthiness: non-null, non-false, non-zero, non-empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a condition. A path that does not resolve makes `equals` and
/// `truthy` false and `exists` false; it is never an error.
pub fn evaluate(condition: &EdgeCondition, results: &Map<String, Value>) -> bool {
    match condition {
        EdgeCondition::Equals { path, value } => {
            resolve_path(results, path).is_some_and(|resolved| resolved == value)
        }
        EdgeCondition::Exists { path } => resolve_path(results, path).is_some(),
        EdgeCondition::Truthy { path } => resolve_path(results, path).is_some_and(is_truthy),
    }
}
