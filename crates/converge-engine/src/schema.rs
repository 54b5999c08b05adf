//! Declarative field metadata
//!
//! A resource type is described by a table of [`FieldDescriptor`]s instead of
//! per-field code. The canonicalizer, differ and request builders all walk
//! the same table, so adding a field to a resource is a one-line change.
//!
//! Nested value objects are [`NestedType`]s. [`ObjectSchema`] is the
//! table-driven implementation; a nested type with unusual equivalence rules
//! can implement the trait directly and override the default behaviour.

use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

use converge_core::{Error, FieldDiff, OperationSelector, Result};

use crate::{canonical, diff};

/// Primitive value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Integer,
    Number,
    Boolean,
    Enum,
    /// Reference to another remote resource; compared by short name
    Reference,
}

impl ScalarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::String => "string",
            ScalarKind::Integer => "integer",
            ScalarKind::Number => "number",
            ScalarKind::Boolean => "boolean",
            ScalarKind::Enum => "enum",
            ScalarKind::Reference => "reference",
        }
    }
}

/// Shape of a field's value
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarKind),
    /// Ordered list of scalars
    List(ScalarKind),
    /// Unordered collection of scalars
    Set(ScalarKind),
    Object(Arc<dyn NestedType>),
    /// Ordered list of nested objects
    ObjectList(Arc<dyn NestedType>),
    /// Unordered collection of nested objects
    ObjectSet(Arc<dyn NestedType>),
}

impl FieldKind {
    pub fn string() -> Self {
        FieldKind::Scalar(ScalarKind::String)
    }

    pub fn integer() -> Self {
        FieldKind::Scalar(ScalarKind::Integer)
    }

    pub fn boolean() -> Self {
        FieldKind::Scalar(ScalarKind::Boolean)
    }

    pub fn enumeration() -> Self {
        FieldKind::Scalar(ScalarKind::Enum)
    }

    pub fn reference() -> Self {
        FieldKind::Scalar(ScalarKind::Reference)
    }

    pub fn object(schema: &Arc<ObjectSchema>) -> Self {
        FieldKind::Object(schema.clone())
    }

    pub fn object_list(schema: &Arc<ObjectSchema>) -> Self {
        FieldKind::ObjectList(schema.clone())
    }

    pub fn object_set(schema: &Arc<ObjectSchema>) -> Self {
        FieldKind::ObjectSet(schema.clone())
    }

    /// Nested type carried by this kind, if any
    pub fn nested(&self) -> Option<&Arc<dyn NestedType>> {
        match self {
            FieldKind::Object(n) | FieldKind::ObjectList(n) | FieldKind::ObjectSet(n) => Some(n),
            _ => None,
        }
    }

    fn describe(&self) -> Value {
        match self {
            FieldKind::Scalar(s) => json!(s.as_str()),
            FieldKind::List(s) => json!({ "list": s.as_str() }),
            FieldKind::Set(s) => json!({ "set": s.as_str() }),
            FieldKind::Object(n) => json!({ "object": n.describe() }),
            FieldKind::ObjectList(n) => json!({ "list": n.describe() }),
            FieldKind::ObjectSet(n) => json!({ "set": n.describe() }),
        }
    }
}

/// Who owns a field's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Addresses the resource; immutable
    Identity,
    /// Settable by the caller
    Mutable,
    /// Assigned by the remote system, never sent
    OutputOnly,
}

/// Metadata for one field of a resource or nested object
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub role: FieldRole,
    /// None on nested fields means "same as the enclosing field"
    pub selector: Option<OperationSelector>,
    /// The server fills this field in when the caller leaves it empty
    pub server_default: bool,
    /// Output-only field whose change still means the resource was replaced
    pub forces_recreate: bool,
    pub required: bool,
    pub description: String,
}

impl FieldDescriptor {
    fn new(name: &str, kind: FieldKind, role: FieldRole, selector: Option<OperationSelector>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            role,
            selector,
            server_default: false,
            forces_recreate: false,
            required: false,
            description: String::new(),
        }
    }

    /// Identity field. Always `RequiresRecreate`.
    pub fn identity(name: &str, kind: ScalarKind) -> Self {
        Self::new(
            name,
            FieldKind::Scalar(kind),
            FieldRole::Identity,
            Some(OperationSelector::RequiresRecreate),
        )
    }

    pub fn mutable(name: &str, kind: FieldKind, selector: OperationSelector) -> Self {
        Self::new(name, kind, FieldRole::Mutable, Some(selector))
    }

    /// Mutable field of a nested object, resolved by the enclosing field's selector
    pub fn nested(name: &str, kind: FieldKind) -> Self {
        Self::new(name, kind, FieldRole::Mutable, None)
    }

    pub fn output_only(name: &str, kind: FieldKind) -> Self {
        Self::new(name, kind, FieldRole::OutputOnly, Some(OperationSelector::Ignore))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn server_default(mut self) -> Self {
        self.server_default = true;
        self
    }

    pub fn forces_recreate(mut self) -> Self {
        self.forces_recreate = true;
        self.selector = Some(OperationSelector::RequiresRecreate);
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn is_identity(&self) -> bool {
        self.role == FieldRole::Identity
    }

    pub fn is_output_only(&self) -> bool {
        self.role == FieldRole::OutputOnly
    }

    /// Selector in effect for this field inside an enclosing field.
    pub fn selector_within(&self, inherited: Option<&OperationSelector>) -> Result<OperationSelector> {
        match self.role {
            FieldRole::Identity => Ok(OperationSelector::RequiresRecreate),
            FieldRole::OutputOnly if self.forces_recreate => Ok(OperationSelector::RequiresRecreate),
            FieldRole::OutputOnly => Ok(OperationSelector::Ignore),
            FieldRole::Mutable => self
                .selector
                .clone()
                .or_else(|| inherited.cloned())
                .ok_or_else(|| {
                    Error::invalid_schema(format!("field {} has no operation selector", self.name))
                }),
        }
    }

    pub fn to_json(&self) -> Value {
        let role = match self.role {
            FieldRole::Identity => "identity",
            FieldRole::Mutable => "mutable",
            FieldRole::OutputOnly => "output_only",
        };
        let mut out = json!({
            "name": self.name,
            "kind": self.kind.describe(),
            "role": role,
        });
        if let Some(selector) = &self.selector {
            out["selector"] = json!(selector.to_string());
        }
        if self.required {
            out["required"] = json!(true);
        }
        if self.server_default {
            out["server_default"] = json!(true);
        }
        if !self.description.is_empty() {
            out["description"] = json!(self.description);
        }
        out
    }
}

/// Where a nested comparison sits inside its parent
#[derive(Debug, Clone)]
pub struct ParentScope {
    pub path: String,
    pub selector: OperationSelector,
    pub output_only: bool,
}

impl ParentScope {
    pub fn child_path(&self, name: &str) -> String {
        format!("{}.{}", self.path, name)
    }
}

/// Capabilities of a nested value object
///
/// The default methods run the table-driven algorithms over [`fields`].
///
/// [`fields`]: NestedType::fields
pub trait NestedType: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str;

    fn fields(&self) -> &[FieldDescriptor];

    /// Sentinel compared against when the actual side is absent
    fn empty(&self) -> Value {
        Value::Object(Map::new())
    }

    fn canonicalize_desired(&self, desired: &Value, initial: Option<&Value>) -> Result<Value> {
        canonical::canonicalize_desired_fields(self.fields(), desired, initial)
    }

    fn canonicalize_new(&self, new: &Value, desired: &Value) -> Result<Value> {
        canonical::canonicalize_new_fields(self.fields(), new, desired)
    }

    fn diff(&self, desired: &Value, actual: &Value, scope: &ParentScope) -> Result<Vec<FieldDiff>> {
        diff::diff_fields(self.fields(), desired, actual, Some(scope))
    }

    /// Request form: output-only fields and nulls removed
    fn expand(&self, value: &Value) -> Value {
        expand_fields(self.fields(), value)
    }

    fn describe(&self) -> Value {
        json!({
            "type": self.type_name(),
            "fields": self.fields().iter().map(FieldDescriptor::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Table-driven nested object
#[derive(Debug, Clone)]
pub struct ObjectSchema {
    name: String,
    fields: Vec<FieldDescriptor>,
}

impl ObjectSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn into_shared(self) -> Arc<ObjectSchema> {
        Arc::new(self)
    }
}

impl NestedType for ObjectSchema {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }
}

/// Strip output-only fields and nulls, recursing into nested objects.
pub fn expand_fields(fields: &[FieldDescriptor], value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return Value::Null;
    };
    let mut out = Map::new();
    for field in fields {
        if field.is_output_only() {
            continue;
        }
        let Some(v) = obj.get(&field.name) else {
            continue;
        };
        let expanded = match (&field.kind, v) {
            (_, Value::Null) => continue,
            (FieldKind::Object(n), v) => n.expand(v),
            (FieldKind::ObjectList(n) | FieldKind::ObjectSet(n), Value::Array(items)) => {
                Value::Array(items.iter().map(|item| n.expand(item)).collect())
            }
            (_, v) => v.clone(),
        };
        if !expanded.is_null() {
            out.insert(field.name.clone(), expanded);
        }
    }
    Value::Object(out)
}
