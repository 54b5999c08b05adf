//! Canonicalization of desired and freshly observed state
//!
//! `canonicalize_desired_fields` merges a caller's configuration with the
//! observed state: every field ends up holding either the caller's value or
//! the observed one, never anything else. `canonicalize_new_fields` does the
//! reverse after an operation, adopting the caller's spelling wherever the
//! server's representation is only cosmetically different.

use serde_json::{Map, Value};

use converge_core::{Error, OperationSelector, Result};

use crate::schema::{FieldDescriptor, FieldKind, NestedType, ParentScope, ScalarKind};
use crate::value::{as_object, is_empty, numbers_equal, short_name};

/// Scalar equivalence under the field's kind
pub fn scalar_equivalent(kind: ScalarKind, a: &Value, b: &Value) -> bool {
    if is_empty(Some(a)) && is_empty(Some(b)) {
        return true;
    }
    match (kind, a, b) {
        (ScalarKind::Reference, Value::String(x), Value::String(y)) => short_name(x) == short_name(y),
        (ScalarKind::Integer | ScalarKind::Number, a, b) => numbers_equal(a, b),
        (ScalarKind::Enum, Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => a == b,
    }
}

/// Ordered lists: same length, pairwise equivalent
pub fn list_equivalent(kind: ScalarKind, a: &Value, b: &Value) -> bool {
    if is_empty(Some(a)) && is_empty(Some(b)) {
        return true;
    }
    match (a.as_array(), b.as_array()) {
        (Some(x), Some(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| scalar_equivalent(kind, p, q))
        }
        _ => false,
    }
}

/// Unordered collections: every element of one side pairs with a distinct
/// equivalent element of the other
pub fn set_equivalent(kind: ScalarKind, a: &Value, b: &Value) -> bool {
    if is_empty(Some(a)) && is_empty(Some(b)) {
        return true;
    }
    let (Some(x), Some(y)) = (a.as_array(), b.as_array()) else {
        return false;
    };
    if x.len() != y.len() {
        return false;
    }
    let mut used = vec![false; y.len()];
    x.iter().all(|p| {
        let found = y
            .iter()
            .enumerate()
            .find(|(idx, q)| !used[*idx] && scalar_equivalent(kind, p, q));
        match found {
            Some((idx, _)) => {
                used[idx] = true;
                true
            }
            None => false,
        }
    })
}

fn expect_object<'a>(field: &str, v: &'a Value) -> Result<&'a Map<String, Value>> {
    v.as_object()
        .ok_or_else(|| Error::invalid_input(format!("field {} must be an object, got {}", field, v)))
}

fn expect_array<'a>(field: &str, v: &'a Value) -> Result<&'a Vec<Value>> {
    v.as_array()
        .ok_or_else(|| Error::invalid_input(format!("field {} must be a list, got {}", field, v)))
}

fn present(v: Option<&Value>) -> Option<&Value> {
    v.filter(|v| !v.is_null())
}

/// Scope used when probing whether two set elements denote the same member
fn probe_scope(field: &FieldDescriptor) -> ParentScope {
    ParentScope {
        path: field.name.clone(),
        selector: field
            .selector
            .clone()
            .unwrap_or(OperationSelector::RequiresRecreate),
        output_only: field.is_output_only(),
    }
}

/// Canonical desired state for one object level.
///
/// `initial` is the already-canonicalized observed state, or None when the
/// resource does not exist yet.
pub fn canonicalize_desired_fields(
    fields: &[FieldDescriptor],
    desired: &Value,
    initial: Option<&Value>,
) -> Result<Value> {
    let empty = Map::new();
    let des = as_object(desired, &empty)
        .ok_or_else(|| Error::invalid_input(format!("desired state must be an object, got {}", desired)))?;
    let init = match present(initial) {
        None => None,
        Some(v) => Some(
            as_object(v, &empty)
                .ok_or_else(|| Error::invalid_input(format!("initial state must be an object, got {}", v)))?,
        ),
    };

    let mut out = Map::new();
    for field in fields {
        let d = des.get(&field.name);
        let i = init.and_then(|m| m.get(&field.name));
        if let Some(v) = canonicalize_desired_field(field, d, i)? {
            if !v.is_null() {
                out.insert(field.name.clone(), v);
            }
        }
    }
    Ok(Value::Object(out))
}

fn canonicalize_desired_field(
    field: &FieldDescriptor,
    desired: Option<&Value>,
    initial: Option<&Value>,
) -> Result<Option<Value>> {
    let initial = present(initial);
    let Some(d) = present(desired) else {
        return Ok(initial.cloned());
    };

    let value = match &field.kind {
        FieldKind::Scalar(kind) => match initial {
            Some(i) if scalar_equivalent(*kind, d, i) => i.clone(),
            _ => d.clone(),
        },
        FieldKind::List(kind) => match initial {
            Some(i) if list_equivalent(*kind, d, i) => i.clone(),
            _ => d.clone(),
        },
        FieldKind::Set(kind) => match initial {
            Some(i) if set_equivalent(*kind, d, i) => i.clone(),
            _ => d.clone(),
        },
        FieldKind::Object(nested) => {
            expect_object(&field.name, d)?;
            match initial {
                None => nested.canonicalize_desired(d, None)?,
                Some(i) if is_empty(Some(d)) && is_empty(Some(i)) => i.clone(),
                Some(i) => nested.canonicalize_desired(d, Some(i))?,
            }
        }
        FieldKind::ObjectList(nested) => {
            let des = expect_array(&field.name, d)?;
            let init = initial.map(|i| expect_array(&field.name, i)).transpose()?;
            if des.is_empty() && init.map_or(true, |i| i.is_empty()) {
                return Ok(Some(initial.unwrap_or(d).clone()));
            }
            // Lengths that differ are never aligned element to element
            let paired = init.filter(|i| i.len() == des.len());
            let items = des
                .iter()
                .enumerate()
                .map(|(idx, item)| nested.canonicalize_desired(item, paired.map(|p| &p[idx])))
                .collect::<Result<Vec<_>>>()?;
            Value::Array(items)
        }
        FieldKind::ObjectSet(nested) => {
            let des = expect_array(&field.name, d)?;
            let init = initial.map(|i| expect_array(&field.name, i)).transpose()?;
            if des.is_empty() && init.map_or(true, |i| i.is_empty()) {
                return Ok(Some(initial.unwrap_or(d).clone()));
            }
            let candidates: &[Value] = init.map(|v| v.as_slice()).unwrap_or(&[]);
            Value::Array(canonicalize_desired_set(field, nested.as_ref(), des, candidates)?)
        }
    };
    Ok(Some(value))
}

/// Pair each desired member with the first unused observed member it is
/// equivalent to; unpaired members are canonicalized on their own.
fn canonicalize_desired_set(
    field: &FieldDescriptor,
    nested: &dyn NestedType,
    desired: &[Value],
    initial: &[Value],
) -> Result<Vec<Value>> {
    let scope = probe_scope(field);
    let mut used = vec![false; initial.len()];
    let mut out = Vec::with_capacity(desired.len());
    'desired: for item in desired {
        for (idx, candidate) in initial.iter().enumerate() {
            if used[idx] {
                continue;
            }
            let merged = nested.canonicalize_desired(item, Some(candidate))?;
            if nested.diff(&merged, candidate, &scope)?.is_empty() {
                used[idx] = true;
                out.push(merged);
                continue 'desired;
            }
        }
        out.push(nested.canonicalize_desired(item, None)?);
    }
    Ok(out)
}

/// Canonical form of a freshly observed state relative to the desired one.
pub fn canonicalize_new_fields(fields: &[FieldDescriptor], new: &Value, desired: &Value) -> Result<Value> {
    let empty = Map::new();
    let nw = as_object(new, &empty)
        .ok_or_else(|| Error::invalid_input(format!("observed state must be an object, got {}", new)))?;
    let des = as_object(desired, &empty)
        .ok_or_else(|| Error::invalid_input(format!("desired state must be an object, got {}", desired)))?;

    let mut out = Map::new();
    for field in fields {
        let value = canonicalize_new_field(field, nw.get(&field.name), des.get(&field.name))?;
        if let Some(v) = value.filter(|v| !v.is_null()) {
            out.insert(field.name.clone(), v);
        }
    }
    Ok(Value::Object(out))
}

fn canonicalize_new_field(
    field: &FieldDescriptor,
    new: Option<&Value>,
    desired: Option<&Value>,
) -> Result<Option<Value>> {
    let (n, d) = match (present(new), present(desired)) {
        (None, None) => return Ok(None),
        // Identity fields the server leaves out keep the caller's value
        (None, Some(d)) if field.is_identity() || is_empty(Some(d)) => return Ok(Some(d.clone())),
        (None, Some(_)) => return Ok(None),
        (Some(n), None) => return canonicalize_new_alone(field, n).map(Some),
        (Some(n), Some(d)) => (n, d),
    };

    let value = match &field.kind {
        FieldKind::Scalar(kind) if scalar_equivalent(*kind, d, n) => d.clone(),
        FieldKind::List(kind) if list_equivalent(*kind, d, n) => d.clone(),
        FieldKind::Set(kind) if set_equivalent(*kind, d, n) => d.clone(),
        FieldKind::Scalar(_) | FieldKind::List(_) | FieldKind::Set(_) => n.clone(),
        FieldKind::Object(nested) => {
            expect_object(&field.name, n)?;
            if is_empty(Some(n)) && is_empty(Some(d)) {
                d.clone()
            } else {
                nested.canonicalize_new(n, d)?
            }
        }
        FieldKind::ObjectList(nested) => {
            let nw = expect_array(&field.name, n)?;
            let des = expect_array(&field.name, d)?;
            let items = if nw.len() == des.len() {
                nw.iter()
                    .zip(des)
                    .map(|(n, d)| nested.canonicalize_new(n, d))
                    .collect::<Result<Vec<_>>>()?
            } else {
                nw.iter()
                    .map(|n| nested.canonicalize_new(n, &Value::Null))
                    .collect::<Result<Vec<_>>>()?
            };
            Value::Array(items)
        }
        FieldKind::ObjectSet(nested) => {
            let nw = expect_array(&field.name, n)?;
            let des = expect_array(&field.name, d)?;
            Value::Array(canonicalize_new_set(field, nested.as_ref(), nw, des)?)
        }
    };
    Ok(Some(value))
}

fn canonicalize_new_alone(field: &FieldDescriptor, n: &Value) -> Result<Value> {
    match &field.kind {
        FieldKind::Object(nested) => {
            expect_object(&field.name, n)?;
            nested.canonicalize_new(n, &Value::Null)
        }
        FieldKind::ObjectList(nested) | FieldKind::ObjectSet(nested) => {
            let items = expect_array(&field.name, n)?
                .iter()
                .map(|item| nested.canonicalize_new(item, &Value::Null))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }
        _ => Ok(n.clone()),
    }
}

/// Matched members in desired order, then whatever the server added.
fn canonicalize_new_set(
    field: &FieldDescriptor,
    nested: &dyn NestedType,
    new: &[Value],
    desired: &[Value],
) -> Result<Vec<Value>> {
    let scope = probe_scope(field);
    let mut used = vec![false; new.len()];
    let mut out = Vec::with_capacity(new.len());
    for d in desired {
        for (idx, n) in new.iter().enumerate() {
            if used[idx] {
                continue;
            }
            if nested.diff(d, n, &scope)?.is_empty() {
                used[idx] = true;
                out.push(nested.canonicalize_new(n, d)?);
                break;
            }
        }
    }
    for (idx, n) in new.iter().enumerate() {
        if !used[idx] {
            out.push(nested.canonicalize_new(n, &Value::Null)?);
        }
    }
    Ok(out)
}
