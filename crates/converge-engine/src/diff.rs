//! Structural diff between two canonical states
//!
//! Fields are walked in declaration order so that the diff list, and the
//! operation plan derived from it, is the same on every run.

use serde_json::{Map, Value};

use converge_core::{Error, FieldDiff, Result};

use crate::canonical::{list_equivalent, scalar_equivalent, set_equivalent};
use crate::schema::{FieldDescriptor, FieldKind, NestedType, ParentScope};
use crate::value::{as_object, is_empty, is_unset};

/// Compare desired against actual. Both states must be present.
pub fn diff_states(
    fields: &[FieldDescriptor],
    desired: Option<&Value>,
    actual: Option<&Value>,
) -> Result<Vec<FieldDiff>> {
    let desired = desired
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::invalid_input("cannot diff: desired state is absent"))?;
    let actual = actual
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::invalid_input("cannot diff: actual state is absent"))?;
    diff_fields(fields, desired, actual, None)
}

/// Diff one object level. `scope` is None at the top of a resource.
pub fn diff_fields(
    fields: &[FieldDescriptor],
    desired: &Value,
    actual: &Value,
    scope: Option<&ParentScope>,
) -> Result<Vec<FieldDiff>> {
    let empty = Map::new();
    let des = as_object(desired, &empty)
        .ok_or_else(|| Error::invalid_input(format!("desired value must be an object, got {}", desired)))?;
    let act = as_object(actual, &empty)
        .ok_or_else(|| Error::invalid_input(format!("actual value must be an object, got {}", actual)))?;

    let mut diffs = Vec::new();
    for field in fields {
        let d = des.get(&field.name);
        // A desired null expresses no opinion
        if is_unset(d) {
            continue;
        }
        if field.server_default && is_empty(d) {
            continue;
        }
        let d = d.unwrap_or(&Value::Null);
        let a = act.get(&field.name).unwrap_or(&Value::Null);

        let child = ParentScope {
            path: match scope {
                Some(parent) => parent.child_path(&field.name),
                None => field.name.clone(),
            },
            selector: field.selector_within(scope.map(|s| &s.selector))?,
            output_only: field.is_output_only() || scope.map_or(false, |s| s.output_only),
        };
        diff_field(field, d, a, &child, &mut diffs)?;
    }
    Ok(diffs)
}

fn field_diff(scope: &ParentScope, before: &Value, after: &Value) -> FieldDiff {
    FieldDiff {
        path: scope.path.clone(),
        before: before.clone(),
        after: after.clone(),
        selector: scope.selector.clone(),
        output_only: scope.output_only,
    }
}

fn diff_field(
    field: &FieldDescriptor,
    d: &Value,
    a: &Value,
    scope: &ParentScope,
    diffs: &mut Vec<FieldDiff>,
) -> Result<()> {
    match &field.kind {
        FieldKind::Scalar(kind) => {
            if !scalar_equivalent(*kind, d, a) {
                diffs.push(field_diff(scope, a, d));
            }
        }
        FieldKind::List(kind) => {
            if !list_equivalent(*kind, d, a) {
                diffs.push(field_diff(scope, a, d));
            }
        }
        FieldKind::Set(kind) => {
            if !set_equivalent(*kind, d, a) {
                diffs.push(field_diff(scope, a, d));
            }
        }
        FieldKind::Object(nested) => {
            if !d.is_object() {
                return Err(Error::invalid_input(format!(
                    "field {} must be an object, got {}",
                    scope.path, d
                )));
            }
            let absent = a.is_null();
            let actual = if absent { nested.empty() } else { a.clone() };
            if !actual.is_object() {
                return Err(Error::invalid_input(format!(
                    "field {} must be an object, got {}",
                    scope.path, a
                )));
            }
            let sub = nested.diff(d, &actual, scope)?;
            if absent && sub.iter().any(FieldDiff::is_actionable) {
                diffs.push(field_diff(scope, a, d));
            } else {
                diffs.extend(sub);
            }
        }
        FieldKind::ObjectList(nested) => {
            let (des, act) = arrays(scope, d, a)?;
            if des.len() != act.len() {
                diffs.push(field_diff(scope, a, d));
                return Ok(());
            }
            let mut sub = Vec::new();
            for (idx, (de, ae)) in des.iter().zip(act).enumerate() {
                let element = ParentScope {
                    path: format!("{}[{}]", scope.path, idx),
                    ..scope.clone()
                };
                sub.extend(nested.diff(de, ae, &element)?);
            }
            // Any positional change is reported against the whole list
            if sub.iter().any(FieldDiff::is_actionable) {
                diffs.push(field_diff(scope, a, d));
            } else {
                diffs.extend(sub);
            }
        }
        FieldKind::ObjectSet(nested) => {
            let (des, act) = arrays(scope, d, a)?;
            if !object_sets_match(nested.as_ref(), scope, des, act)? {
                diffs.push(field_diff(scope, a, d));
            }
        }
    }
    Ok(())
}

fn arrays<'a>(scope: &ParentScope, d: &'a Value, a: &'a Value) -> Result<(&'a [Value], &'a [Value])> {
    let des = d.as_array().ok_or_else(|| {
        Error::invalid_input(format!("field {} must be a list, got {}", scope.path, d))
    })?;
    let act: &[Value] = match a {
        Value::Null => &[],
        Value::Array(items) => items,
        other => {
            return Err(Error::invalid_input(format!(
                "field {} must be a list, got {}",
                scope.path, other
            )))
        }
    };
    Ok((des, act))
}

/// Every desired member has an actual counterpart and nothing is left over
fn object_sets_match(
    nested: &dyn NestedType,
    scope: &ParentScope,
    desired: &[Value],
    actual: &[Value],
) -> Result<bool> {
    if desired.len() != actual.len() {
        return Ok(false);
    }
    let mut used = vec![false; actual.len()];
    for d in desired {
        let mut matched = false;
        for (idx, a) in actual.iter().enumerate() {
            if used[idx] {
                continue;
            }
            let sub = nested.diff(d, a, scope)?;
            if !sub.iter().any(FieldDiff::is_actionable) {
                used[idx] = true;
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Differences that take part in planning
pub fn actionable(diffs: &[FieldDiff]) -> Vec<FieldDiff> {
    diffs.iter().filter(|d| d.is_actionable()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::OperationSelector;
    use crate::schema::{ObjectSchema, ScalarKind};
    use serde_json::json;

    fn fields() -> Vec<FieldDescriptor> {
        let fixed = ObjectSchema::new("FixedOrPercent")
            .field(FieldDescriptor::nested("fixed", FieldKind::integer()))
            .field(FieldDescriptor::output_only("calculated", FieldKind::integer()))
            .into_shared();
        let policy = ObjectSchema::new("UpdatePolicy")
            .field(FieldDescriptor::nested("type", FieldKind::enumeration()))
            .field(FieldDescriptor::nested("maxSurge", FieldKind::object(&fixed)))
            .into_shared();
        let version = ObjectSchema::new("Version")
            .field(FieldDescriptor::nested("name", FieldKind::string()))
            .field(FieldDescriptor::nested("instanceTemplate", FieldKind::reference()))
            .into_shared();
        let port = ObjectSchema::new("NamedPort")
            .field(FieldDescriptor::nested("name", FieldKind::string()))
            .field(FieldDescriptor::nested("port", FieldKind::integer()))
            .field(FieldDescriptor::output_only("uid", FieldKind::string()))
            .into_shared();
        let patch = OperationSelector::triggers("patch");
        vec![
            FieldDescriptor::identity("name", ScalarKind::String),
            FieldDescriptor::mutable("description", FieldKind::string(), OperationSelector::RequiresRecreate),
            FieldDescriptor::mutable("targetSize", FieldKind::integer(), patch.clone()),
            FieldDescriptor::mutable("updatePolicy", FieldKind::object(&policy), patch.clone()),
            FieldDescriptor::mutable("versions", FieldKind::object_list(&version), patch.clone()),
            FieldDescriptor::mutable("zones", FieldKind::List(ScalarKind::Reference), patch.clone()),
            FieldDescriptor::mutable(
                "targetPools",
                FieldKind::Set(ScalarKind::Reference),
                OperationSelector::triggers("setTargetPools"),
            ),
            FieldDescriptor::mutable("distributionPolicy", FieldKind::string(), patch).server_default(),
            FieldDescriptor::mutable("namedPorts", FieldKind::object_set(&port), OperationSelector::RequiresRecreate),
            FieldDescriptor::output_only("status", FieldKind::string()),
        ]
    }

    fn paths(diffs: &[FieldDiff]) -> Vec<&str> {
        diffs.iter().map(|d| d.path.as_str()).collect()
    }

    #[test]
    fn test_same_state_has_no_diffs() {
        let s = json!({
            "name": "web",
            "targetSize": 3,
            "updatePolicy": {"type": "PROACTIVE", "maxSurge": {"fixed": 1, "calculated": 1}},
            "versions": [{"name": "v1", "instanceTemplate": "t"}],
            "targetPools": ["a", "b"],
            "status": "STABLE",
        });
        assert!(diff_states(&fields(), Some(&s), Some(&s)).unwrap().is_empty());
    }

    #[test]
    fn test_absent_side_is_invalid_input() {
        let s = json!({"name": "web"});
        assert!(matches!(
            diff_states(&fields(), None, Some(&s)),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            diff_states(&fields(), Some(&s), Some(&Value::Null)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_identity_and_mutable_selectors() {
        let desired = json!({"name": "web2", "targetSize": 3});
        let actual = json!({"name": "web", "targetSize": 1});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["name", "targetSize"]);
        assert_eq!(diffs[0].selector, OperationSelector::RequiresRecreate);
        assert_eq!(diffs[1].selector, OperationSelector::triggers("patch"));
        assert_eq!(diffs[1].before, json!(1));
        assert_eq!(diffs[1].after, json!(3));
    }

    #[test]
    fn test_nested_paths_inherit_parent_selector() {
        let desired = json!({"updatePolicy": {"type": "PROACTIVE", "maxSurge": {"fixed": 2}}});
        let actual = json!({"updatePolicy": {"type": "PROACTIVE", "maxSurge": {"fixed": 1}}});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["updatePolicy.maxSurge.fixed"]);
        assert_eq!(diffs[0].selector, OperationSelector::triggers("patch"));
    }

    #[test]
    fn test_nested_output_only_is_ignored() {
        let desired = json!({"updatePolicy": {"maxSurge": {"fixed": 1, "calculated": 1}}});
        let actual = json!({"updatePolicy": {"maxSurge": {"fixed": 1, "calculated": 4}}});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["updatePolicy.maxSurge.calculated"]);
        assert!(diffs[0].output_only);
        assert!(!diffs[0].is_actionable());
    }

    #[test]
    fn test_absent_nested_object_collapses_to_parent() {
        let desired = json!({"updatePolicy": {"type": "PROACTIVE", "maxSurge": {"fixed": 2}}});
        let actual = json!({"name": "web"});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["updatePolicy"]);
        assert_eq!(diffs[0].before, Value::Null);

        let empty_desired = json!({"updatePolicy": {}});
        assert!(diff_states(&fields(), Some(&empty_desired), Some(&actual)).unwrap().is_empty());
    }

    #[test]
    fn test_ordered_list_mismatch_is_whole_field() {
        let actual = json!({"versions": [{"name": "a", "instanceTemplate": "t1"}, {"name": "b", "instanceTemplate": "t2"}]});
        let reordered = json!({"versions": [{"name": "b", "instanceTemplate": "t2"}, {"name": "a", "instanceTemplate": "t1"}]});
        let diffs = diff_states(&fields(), Some(&reordered), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["versions"]);

        let shorter = json!({"versions": [{"name": "a", "instanceTemplate": "t1"}]});
        let diffs = diff_states(&fields(), Some(&shorter), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["versions"]);

        let zones = json!({"zones": ["z1", "z2"]});
        let diffs = diff_states(&fields(), Some(&zones), Some(&json!({"zones": ["z2", "z1"]}))).unwrap();
        assert_eq!(paths(&diffs), vec!["zones"]);
    }

    #[test]
    fn test_sets_ignore_order_but_not_membership() {
        let desired = json!({"targetPools": ["a", "b"]});
        let same = json!({"targetPools": ["regions/r/targetPools/b", "a"]});
        assert!(diff_states(&fields(), Some(&desired), Some(&same)).unwrap().is_empty());

        let extra = json!({"targetPools": ["a", "b", "c"]});
        let diffs = diff_states(&fields(), Some(&desired), Some(&extra)).unwrap();
        assert_eq!(paths(&diffs), vec!["targetPools"]);
        assert_eq!(diffs[0].selector, OperationSelector::triggers("setTargetPools"));
    }

    #[test]
    fn test_object_set_ignores_member_order() {
        let desired = json!({"namedPorts": [{"name": "http", "port": 80}, {"name": "https", "port": 443}]});
        let actual = json!({"namedPorts": [{"name": "https", "port": 443}, {"name": "http", "port": 80}]});
        assert!(diff_states(&fields(), Some(&desired), Some(&actual)).unwrap().is_empty());
    }

    #[test]
    fn test_object_set_changed_member_is_whole_field() {
        let desired = json!({"namedPorts": [{"name": "http", "port": 8080}, {"name": "https", "port": 443}]});
        let actual = json!({"namedPorts": [{"name": "https", "port": 443}, {"name": "http", "port": 80}]});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["namedPorts"]);
        assert_eq!(diffs[0].selector, OperationSelector::RequiresRecreate);
        assert_eq!(diffs[0].before, actual["namedPorts"]);
    }

    #[test]
    fn test_object_set_extra_actual_member_is_removal() {
        let desired = json!({"namedPorts": [{"name": "http", "port": 80}]});
        let actual = json!({"namedPorts": [{"name": "http", "port": 80}, {"name": "ssh", "port": 22}]});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert_eq!(paths(&diffs), vec!["namedPorts"]);
        assert_eq!(diffs[0].after, desired["namedPorts"]);
    }

    #[test]
    fn test_object_set_output_only_subfield_matches() {
        let desired = json!({"namedPorts": [{"name": "http", "port": 80, "uid": "a"}]});
        let actual = json!({"namedPorts": [{"name": "http", "port": 80, "uid": "b"}]});
        let diffs = diff_states(&fields(), Some(&desired), Some(&actual)).unwrap();
        assert!(actionable(&diffs).is_empty());
    }

    #[test]
    fn test_unset_and_server_default_fields_are_skipped() {
        let desired = json!({"name": "web", "description": null, "distributionPolicy": ""});
        let actual = json!({"name": "web", "description": "old", "distributionPolicy": "EVEN"});
        assert!(diff_states(&fields(), Some(&desired), Some(&actual)).unwrap().is_empty());
    }

    #[test]
    fn test_output_only_is_recorded_not_actionable() {
        let diffs = diff_states(
            &fields(),
            Some(&json!({"status": "STABLE"})),
            Some(&json!({"status": "UPDATING"})),
        )
        .unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].output_only);
        assert!(actionable(&diffs).is_empty());
    }

    #[test]
    fn test_object_type_mismatch_fails() {
        let err = diff_states(
            &fields(),
            Some(&json!({"updatePolicy": {"type": "X"}})),
            Some(&json!({"updatePolicy": "X"})),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
