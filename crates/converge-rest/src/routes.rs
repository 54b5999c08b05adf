//! URL templates per resource kind
//!
//! Paths are written with `{field}` placeholders that are filled from the
//! identity of a [`ResourceKey`]. A route may also derive extra variables
//! from the key, e.g. whether a location names a zone or a region.

use reqwest::Method;
use std::collections::BTreeMap;
use std::fmt;

use converge_core::{Error, ResourceKey, Result};
use converge_engine::schemas::instance_group_manager::{self, PATCH, SET_TARGET_POOLS};

/// Computes a template variable from the resource key
pub type Derive = fn(&ResourceKey) -> Option<String>;

/// A path with `{name}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    pub fn new(template: &str) -> Self {
        Self(template.trim_matches('/').to_string())
    }

    /// Substitute every placeholder. Unknown or empty variables are an error.
    pub fn expand(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::invalid_input(format!("unterminated placeholder in {}", self.0))
            })?;
            let name = &after[..close];
            let value = vars
                .get(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::invalid_input(format!("no value for {{{}}} in {}", name, self.0)))?;
            out.push_str(&urlencoding::encode(value));
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a named update operation is sent
#[derive(Debug, Clone)]
pub struct UpdateRoute {
    pub method: Method,
    /// Custom verb appended to the resource path, e.g. `setTargetPools`
    pub verb: Option<String>,
}

/// Endpoints for one resource kind
#[derive(Debug, Clone)]
pub struct Routes {
    pub kind: String,
    pub resource: UrlTemplate,
    pub collection: UrlTemplate,
    pub updates: BTreeMap<String, UpdateRoute>,
    /// Field of a list response holding the records
    pub items_field: String,
    derived: Vec<(String, Derive)>,
}

impl Routes {
    pub fn new(kind: &str, collection: &str, resource: &str) -> Self {
        Self {
            kind: kind.to_string(),
            resource: UrlTemplate::new(resource),
            collection: UrlTemplate::new(collection),
            updates: BTreeMap::new(),
            items_field: "items".to_string(),
            derived: Vec::new(),
        }
    }

    /// Send update `name` with `method` to the resource path
    pub fn update(mut self, name: &str, method: Method) -> Self {
        self.updates
            .insert(name.to_string(), UpdateRoute { method, verb: None });
        self
    }

    /// Send update `name` as `POST {resource}/{verb}`
    pub fn verb(mut self, name: &str, verb: &str) -> Self {
        self.updates.insert(
            name.to_string(),
            UpdateRoute {
                method: Method::POST,
                verb: Some(verb.to_string()),
            },
        );
        self
    }

    pub fn derive(mut self, variable: &str, f: Derive) -> Self {
        self.derived.push((variable.to_string(), f));
        self
    }

    pub fn items_field(mut self, field: &str) -> Self {
        self.items_field = field.to_string();
        self
    }

    fn vars(&self, key: &ResourceKey) -> BTreeMap<String, String> {
        let mut vars = key.identity.clone();
        for (name, derive) in &self.derived {
            if let Some(value) = derive(key) {
                vars.insert(name.clone(), value);
            }
        }
        vars
    }

    pub fn resource_path(&self, key: &ResourceKey) -> Result<String> {
        self.resource.expand(&self.vars(key))
    }

    pub fn collection_path(&self, key: &ResourceKey) -> Result<String> {
        self.collection.expand(&self.vars(key))
    }

    /// Method and path for a named update
    pub fn update_request(&self, name: &str, key: &ResourceKey) -> Result<(Method, String)> {
        let route = self.updates.get(name).ok_or_else(|| {
            Error::invalid_input(format!("{}: no route for operation {}", self.kind, name))
        })?;
        let path = self.resource_path(key)?;
        let path = match &route.verb {
            Some(verb) => format!("{}/{}", path, verb),
            None => path,
        };
        Ok((route.method.clone(), path))
    }

    /// Compute API routes for managed instance groups. The location picks
    /// between the zonal and regional collections.
    pub fn instance_group_manager() -> Self {
        Routes::new(
            instance_group_manager::KIND,
            "projects/{project}/{scope}/{location}/instanceGroupManagers",
            "projects/{project}/{scope}/{location}/instanceGroupManagers/{name}",
        )
        .derive("scope", |key| key.get("location").map(location_scope))
        .update(PATCH, Method::PATCH)
        .verb(SET_TARGET_POOLS, SET_TARGET_POOLS)
    }
}

/// `zones` for `us-central1-a`, `regions` for `us-central1`
pub fn location_scope(location: &str) -> String {
    if location.split('-').count() >= 3 {
        "zones".to_string()
    } else {
        "regions".to_string()
    }
}
