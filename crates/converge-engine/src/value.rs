//! JSON value predicates shared by the canonicalizer, differ and matcher

use serde_json::{Map, Value};

/// The caller left the field unset.
pub fn is_unset(v: Option<&Value>) -> bool {
    matches!(v, None | Some(Value::Null))
}

/// Unset, or the empty value of its type (`""`, `0`, `false`, `[]`, `{}`).
pub fn is_empty(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.values().all(|v| is_empty(Some(v))),
    }
}

/// Last path segment of a resource reference, so that
/// `projects/p/global/instanceTemplates/tmpl-a` and `tmpl-a` compare equal.
pub fn short_name(s: &str) -> &str {
    s.trim_end_matches('/').rsplit('/').next().unwrap_or(s)
}

/// Numeric equality that does not distinguish `3` from `3.0`.
pub fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Render an identity value as a plain string for addressing.
pub fn as_identity_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Object view of a state, treating null as the empty object.
pub fn as_object<'a>(v: &'a Value, empty: &'a Map<String, Value>) -> Option<&'a Map<String, Value>> {
    match v {
        Value::Null => Some(empty),
        Value::Object(map) => Some(map),
        _ => None,
    }
}
