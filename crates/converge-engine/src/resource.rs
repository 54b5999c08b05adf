//! Resource type definitions
//!
//! A [`ResourceType`] bundles the field table of one kind of remote resource
//! with its operation registry and the few per-type rules the generic
//! algorithms need: which field carries the concurrency token, which fields
//! scope listings, and which fields are mutually exclusive.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::debug;

use converge_core::{Error, FieldDiff, OperationSelector, ResourceKey, Result, State};

use crate::canonical::{canonicalize_desired_fields, canonicalize_new_fields};
use crate::diff::diff_states;
use crate::operation::ApiOperation;
use crate::registry::OperationRegistry;
use crate::schema::{expand_fields, FieldDescriptor, FieldKind, FieldRole, ScalarKind};
use crate::value::{as_identity_string, is_unset, short_name};

#[derive(Debug)]
pub struct ResourceType {
    kind: String,
    fields: Vec<FieldDescriptor>,
    parent_fields: Vec<String>,
    token_field: Option<String>,
    exclusive_groups: Vec<Vec<String>>,
    registry: OperationRegistry,
}

impl ResourceType {
    pub fn builder(kind: &str) -> ResourceTypeBuilder {
        ResourceTypeBuilder::new(kind)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn identity_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_identity())
    }

    pub fn parent_fields(&self) -> &[String] {
        &self.parent_fields
    }

    pub fn token_field(&self) -> Option<&str> {
        self.token_field.as_deref()
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Instantiate a registered update operation
    pub fn operation(&self, name: &str) -> Result<Box<dyn ApiOperation>> {
        self.registry.build(name)
    }

    /// Concurrency token carried by a state, if any
    pub fn token(&self, state: &State) -> Option<String> {
        let field = self.token_field.as_deref()?;
        state.get(field).and_then(as_identity_string)
    }

    fn identity_value(field: &FieldDescriptor, v: &Value) -> Option<String> {
        let raw = as_identity_string(v)?;
        match field.kind {
            FieldKind::Scalar(ScalarKind::Reference) => Some(short_name(&raw).to_string()),
            _ => Some(raw),
        }
    }

    /// Address of the resource a state describes
    pub fn key_for(&self, state: &State) -> Result<ResourceKey> {
        let mut key = ResourceKey::new(&self.kind);
        for field in self.identity_fields() {
            match state.get(&field.name).and_then(|v| Self::identity_value(field, v)) {
                Some(value) => key = key.with(&field.name, value),
                None if field.required => {
                    return Err(Error::invalid_input(format!(
                        "{}: required identity field {} is not set",
                        self.kind, field.name
                    )))
                }
                None => {}
            }
        }
        Ok(key)
    }

    /// Address of the scope a state's resource is listed under
    pub fn parent_key(&self, state: &State) -> ResourceKey {
        let mut key = ResourceKey::new(&self.kind);
        for name in &self.parent_fields {
            let value = self
                .field(name)
                .zip(state.get(name))
                .and_then(|(field, v)| Self::identity_value(field, v));
            if let Some(value) = value {
                key = key.with(name, value);
            }
        }
        key
    }

    /// Reject desired states the engine cannot act on: not an object,
    /// missing required fields, or more than one member of an exclusive
    /// group set.
    pub fn validate_desired(&self, raw: &State) -> Result<()> {
        let obj = raw.as_object().ok_or_else(|| {
            Error::invalid_input(format!("{}: desired state must be an object", self.kind))
        })?;

        for field in self.fields.iter().filter(|f| f.required) {
            if is_unset(obj.get(&field.name)) {
                return Err(Error::invalid_input(format!(
                    "{}: required field {} is not set",
                    self.kind, field.name
                )));
            }
        }

        for group in &self.exclusive_groups {
            let set: Vec<&str> = group
                .iter()
                .filter(|name| !is_unset(obj.get(name.as_str())))
                .map(String::as_str)
                .collect();
            if set.len() > 1 {
                return Err(Error::invalid_input(format!(
                    "{}: only one of {} may be set, got {}",
                    self.kind,
                    group.join(", "),
                    set.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Canonical desired state against the canonical observed state.
    ///
    /// Members of an exclusive group adopted from `initial` are cleared when
    /// the caller set a different member.
    pub fn canonicalize_desired(&self, raw: &State, initial: Option<&State>) -> Result<State> {
        let mut canonical = canonicalize_desired_fields(&self.fields, raw, initial)?;
        if let Some(out) = canonical.as_object_mut() {
            for group in &self.exclusive_groups {
                let chosen: Vec<&String> = group
                    .iter()
                    .filter(|name| !is_unset(raw.get(name.as_str())))
                    .collect();
                if chosen.is_empty() {
                    continue;
                }
                for name in group.iter().filter(|n| !chosen.contains(n)) {
                    if out.remove(name).is_some() {
                        debug!(field = %name, "Cleared exclusive field not chosen by desired state");
                    }
                }
            }
        }
        Ok(canonical)
    }

    /// Observed state after it has been canonicalized against the fetch
    /// request. When the server reports several members of an exclusive
    /// group, keep the one the caller set, or the last one if the caller
    /// set none.
    pub fn canonicalize_initial(&self, initial: &State, raw_desired: &State) -> State {
        let mut out = initial.clone();
        let Some(obj) = out.as_object_mut() else {
            return out;
        };
        for group in &self.exclusive_groups {
            let present: Vec<&String> = group
                .iter()
                .filter(|name| !is_unset(obj.get(name.as_str())))
                .collect();
            if present.len() < 2 {
                continue;
            }
            let chosen: BTreeSet<&String> = present
                .iter()
                .copied()
                .filter(|name| !is_unset(raw_desired.get(name.as_str())))
                .collect();
            let keep: BTreeSet<&String> = if chosen.is_empty() {
                present.last().copied().into_iter().collect()
            } else {
                chosen
            };
            let drop: Vec<String> = present
                .iter()
                .filter(|name| !keep.contains(*name))
                .map(|name| name.to_string())
                .collect();
            for name in drop {
                obj.remove(&name);
            }
        }
        out
    }

    /// Canonical form of a freshly observed state
    pub fn canonicalize_new(&self, new: &State, raw_desired: &State) -> Result<State> {
        canonicalize_new_fields(&self.fields, new, raw_desired)
    }

    pub fn diff(&self, desired: Option<&State>, actual: Option<&State>) -> Result<Vec<FieldDiff>> {
        diff_states(&self.fields, desired, actual)
    }

    /// Request body for a create: output-only fields and nulls removed
    pub fn expand(&self, state: &State) -> Value {
        expand_fields(&self.fields, state)
    }

    /// Top-level fields an update operation is responsible for: the field
    /// itself or any field nested inside it routes changes to `name`
    pub fn fields_for_operation(&self, name: &str) -> Vec<&FieldDescriptor> {
        self.fields.iter().filter(|f| routes_to(f, name)).collect()
    }

    /// Request body for an update: the fields routed to `name`, plus the
    /// top-level ancestor of every planned difference that names it
    pub fn update_body(&self, name: &str, desired: &State, diffs: &[FieldDiff]) -> Value {
        let fields: Vec<FieldDescriptor> = self
            .fields
            .iter()
            .filter(|f| {
                routes_to(f, name)
                    || diffs
                        .iter()
                        .any(|d| d.selector.operation() == Some(name) && top_level_name(&d.path) == f.name)
            })
            .cloned()
            .collect();
        expand_fields(&fields, desired)
    }

    /// Machine-readable description of the field table
    pub fn describe(&self) -> Value {
        json!({
            "kind": self.kind,
            "fields": self.fields.iter().map(FieldDescriptor::to_json).collect::<Vec<_>>(),
            "parent_fields": self.parent_fields,
            "token_field": self.token_field,
            "exclusive_groups": self.exclusive_groups,
            "operations": self.registry.names(),
        })
    }
}

fn routes_to(field: &FieldDescriptor, name: &str) -> bool {
    if field.role != FieldRole::Mutable {
        return false;
    }
    if field.selector.as_ref().and_then(OperationSelector::operation) == Some(name) {
        return true;
    }
    field
        .kind
        .nested()
        .map_or(false, |nested| nested.fields().iter().any(|f| routes_to(f, name)))
}

/// `updatePolicy` for `updatePolicy.maxSurge.fixed` or `versions[1].name`
fn top_level_name(path: &str) -> &str {
    path.split(|c| c == '.' || c == '[').next().unwrap_or(path)
}

/// Builder for [`ResourceType`]; validation happens in [`build`].
///
/// [`build`]: ResourceTypeBuilder::build
pub struct ResourceTypeBuilder {
    kind: String,
    fields: Vec<FieldDescriptor>,
    parent_fields: Vec<String>,
    token_field: Option<String>,
    exclusive_groups: Vec<Vec<String>>,
    registry: OperationRegistry,
}

impl ResourceTypeBuilder {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            fields: Vec::new(),
            parent_fields: Vec::new(),
            token_field: None,
            exclusive_groups: Vec::new(),
            registry: OperationRegistry::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn parent_fields(mut self, names: &[&str]) -> Self {
        self.parent_fields = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn token_field(mut self, name: &str) -> Self {
        self.token_field = Some(name.to_string());
        self
    }

    pub fn exclusive(mut self, names: &[&str]) -> Self {
        self.exclusive_groups
            .push(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Route `name` to the generic field-subset update
    pub fn update_operation(mut self, name: &str) -> Self {
        self.registry.register_update(name);
        self
    }

    pub fn operation<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ApiOperation> + Send + Sync + 'static,
    {
        self.registry.register(name, factory);
        self
    }

    pub fn build(self) -> Result<ResourceType> {
        validate_fields(&self.kind, &self.fields, &self.registry, true)?;

        if !self.fields.iter().any(FieldDescriptor::is_identity) {
            return Err(Error::invalid_schema(format!("{}: no identity fields", self.kind)));
        }
        let known = |name: &str| self.fields.iter().any(|f| f.name == name);
        for name in &self.parent_fields {
            if !self.fields.iter().any(|f| &f.name == name && f.is_identity()) {
                return Err(Error::invalid_schema(format!(
                    "{}: parent field {} is not an identity field",
                    self.kind, name
                )));
            }
        }
        if let Some(token) = &self.token_field {
            if !known(token) {
                return Err(Error::invalid_schema(format!(
                    "{}: unknown token field {}",
                    self.kind, token
                )));
            }
        }
        for group in &self.exclusive_groups {
            if group.len() < 2 {
                return Err(Error::invalid_schema(format!(
                    "{}: exclusive group needs at least two fields",
                    self.kind
                )));
            }
            if let Some(name) = group.iter().find(|n| !known(n)) {
                return Err(Error::invalid_schema(format!(
                    "{}: unknown field {} in exclusive group",
                    self.kind, name
                )));
            }
        }

        Ok(ResourceType {
            kind: self.kind,
            fields: self.fields,
            parent_fields: self.parent_fields,
            token_field: self.token_field,
            exclusive_groups: self.exclusive_groups,
            registry: self.registry,
        })
    }
}

fn validate_fields(
    owner: &str,
    fields: &[FieldDescriptor],
    registry: &OperationRegistry,
    top_level: bool,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for field in fields {
        let at = format!("{}.{}", owner, field.name);
        if !seen.insert(field.name.as_str()) {
            return Err(Error::invalid_schema(format!("{}: duplicate field", at)));
        }
        match (field.role, &field.selector) {
            (FieldRole::Identity, _) if !top_level => {
                return Err(Error::invalid_schema(format!(
                    "{}: identity fields are only allowed at the top level",
                    at
                )))
            }
            (FieldRole::Identity, Some(OperationSelector::RequiresRecreate)) => {}
            (FieldRole::Identity, _) => {
                return Err(Error::invalid_schema(format!(
                    "{}: identity fields must require recreate",
                    at
                )))
            }
            (FieldRole::OutputOnly, Some(OperationSelector::TriggersOperation(_))) => {
                return Err(Error::invalid_schema(format!(
                    "{}: output-only fields cannot trigger updates",
                    at
                )))
            }
            (FieldRole::Mutable, None) if top_level => {
                return Err(Error::invalid_schema(format!("{}: no operation selector", at)))
            }
            (_, Some(OperationSelector::TriggersOperation(name))) if !registry.contains(name) => {
                return Err(Error::invalid_schema(format!(
                    "{}: operation {} is not registered",
                    at, name
                )))
            }
            _ => {}
        }
        if field.is_identity() && !matches!(field.kind, FieldKind::Scalar(_)) {
            return Err(Error::invalid_schema(format!("{}: identity fields must be scalar", at)));
        }
        if let Some(nested) = field.kind.nested() {
            validate_fields(&at, nested.fields(), registry, false)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ObjectSchema;

    fn builder() -> ResourceTypeBuilder {
        let patch = OperationSelector::triggers("patch");
        ResourceType::builder("test.Group")
            .field(FieldDescriptor::identity("project", ScalarKind::Reference))
            .field(FieldDescriptor::identity("name", ScalarKind::String).required())
            .field(FieldDescriptor::mutable("instanceTemplate", FieldKind::reference(), patch.clone()))
            .field(FieldDescriptor::mutable("versions", FieldKind::List(ScalarKind::String), patch.clone()))
            .field(FieldDescriptor::mutable("targetSize", FieldKind::integer(), patch))
            .field(FieldDescriptor::output_only("fingerprint", FieldKind::string()))
            .parent_fields(&["project"])
            .token_field("fingerprint")
            .exclusive(&["instanceTemplate", "versions"])
            .update_operation("patch")
    }

    #[test]
    fn test_build_and_describe() {
        let rt = builder().build().unwrap();
        assert_eq!(rt.kind(), "test.Group");
        let described = rt.describe();
        assert_eq!(described["token_field"], "fingerprint");
        assert_eq!(described["operations"], json!(["patch"]));
        assert_eq!(rt.fields_for_operation("patch").len(), 3);
    }

    #[test]
    fn test_unregistered_operation_rejected() {
        let err = ResourceType::builder("test.Bad")
            .field(FieldDescriptor::identity("name", ScalarKind::String))
            .field(FieldDescriptor::mutable(
                "size",
                FieldKind::integer(),
                OperationSelector::triggers("resize"),
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchema(_)));
    }

    #[test]
    fn test_nested_unregistered_operation_rejected() {
        let nested = ObjectSchema::new("Inner")
            .field(FieldDescriptor::mutable("x", FieldKind::integer(), OperationSelector::triggers("poke")))
            .into_shared();
        let err = ResourceType::builder("test.Bad")
            .field(FieldDescriptor::identity("name", ScalarKind::String))
            .field(FieldDescriptor::mutable("inner", FieldKind::object(&nested), OperationSelector::RequiresRecreate))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("poke"));
    }

    #[test]
    fn test_identity_must_recreate() {
        let mut name = FieldDescriptor::identity("name", ScalarKind::String);
        name.selector = Some(OperationSelector::triggers("patch"));
        let err = ResourceType::builder("test.Bad")
            .field(name)
            .update_operation("patch")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchema(_)));
    }

    #[test]
    fn test_key_for_uses_short_references() {
        let rt = builder().build().unwrap();
        let key = rt
            .key_for(&json!({"project": "projects/p1", "name": "web"}))
            .unwrap();
        assert_eq!(key.get("project"), Some("p1"));
        assert_eq!(key.get("name"), Some("web"));
        assert!(rt.key_for(&json!({"project": "p1"})).is_err());
        assert_eq!(rt.parent_key(&json!({"project": "p1", "name": "web"})).get("name"), None);
    }

    #[test]
    fn test_validate_desired() {
        let rt = builder().build().unwrap();
        assert!(rt.validate_desired(&json!({"name": "web", "targetSize": 1})).is_ok());
        assert!(rt.validate_desired(&json!({"targetSize": 1})).is_err());
        assert!(rt.validate_desired(&json!(["web"])).is_err());
        let err = rt
            .validate_desired(&json!({"name": "web", "instanceTemplate": "t", "versions": ["v"]}))
            .unwrap_err();
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn test_exclusive_member_cleared_when_other_chosen() {
        let rt = builder().build().unwrap();
        let initial = json!({"name": "web", "instanceTemplate": "t"});
        let desired = rt
            .canonicalize_desired(&json!({"name": "web", "versions": ["v1"]}), Some(&initial))
            .unwrap();
        assert_eq!(desired, json!({"name": "web", "versions": ["v1"]}));
    }

    #[test]
    fn test_initial_keeps_chosen_exclusive_member() {
        let rt = builder().build().unwrap();
        let initial = json!({"name": "web", "instanceTemplate": "t", "versions": ["v1"]});
        assert_eq!(
            rt.canonicalize_initial(&initial, &json!({"name": "web", "instanceTemplate": "t"})),
            json!({"name": "web", "instanceTemplate": "t"})
        );
        assert_eq!(
            rt.canonicalize_initial(&initial, &json!({"name": "web"})),
            json!({"name": "web", "versions": ["v1"]})
        );
    }

    #[test]
    fn test_update_body_only_routed_fields() {
        let rt = builder().build().unwrap();
        let body = rt.update_body(
            "patch",
            &json!({"name": "web", "targetSize": 3, "fingerprint": "abc", "versions": null}),
            &[],
        );
        assert_eq!(body, json!({"targetSize": 3}));
        assert_eq!(rt.token(&json!({"fingerprint": "abc"})), Some("abc".to_string()));
    }

    fn shaped() -> ResourceType {
        let policy = ObjectSchema::new("Policy")
            .field(FieldDescriptor::nested("zones", FieldKind::List(ScalarKind::String)))
            .field(FieldDescriptor::mutable(
                "shape",
                FieldKind::enumeration(),
                OperationSelector::triggers("patch"),
            ))
            .into_shared();
        ResourceType::builder("test.Shaped")
            .field(FieldDescriptor::identity("name", ScalarKind::String))
            .field(FieldDescriptor::mutable("size", FieldKind::integer(), OperationSelector::triggers("patch")))
            .field(FieldDescriptor::mutable("policy", FieldKind::object(&policy), OperationSelector::RequiresRecreate))
            .update_operation("patch")
            .build()
            .unwrap()
    }

    #[test]
    fn test_update_body_carries_parent_of_nested_routed_field() {
        let rt = shaped();
        let names: Vec<&str> = rt.fields_for_operation("patch").iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["size", "policy"]);

        let desired = json!({"name": "web", "size": 1, "policy": {"zones": ["a"], "shape": "BALANCED"}});
        let actual = json!({"name": "web", "size": 1, "policy": {"zones": ["a"], "shape": "EVEN"}});
        let diffs = rt.diff(Some(&desired), Some(&actual)).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "policy.shape");
        assert_eq!(diffs[0].selector, OperationSelector::triggers("patch"));

        let body = rt.update_body("patch", &desired, &diffs);
        assert_eq!(body["policy"], json!({"zones": ["a"], "shape": "BALANCED"}));
        assert_eq!(body["size"], 1);
    }

    #[test]
    fn test_update_body_includes_ancestors_of_planned_diffs() {
        let rt = builder().build().unwrap();
        let diff = FieldDiff {
            path: "versions[0]".into(),
            before: json!(null),
            after: json!("v2"),
            selector: OperationSelector::triggers("resize"),
            output_only: false,
        };
        let desired = json!({"name": "web", "versions": ["v2"], "description": "x"});
        assert_eq!(rt.update_body("resize", &desired, &[]), json!({}));
        assert_eq!(rt.update_body("resize", &desired, &[diff]), json!({"versions": ["v2"]}));
    }
}
