//! Desired-state files and command-line key overrides

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::path::Path;

use converge_core::ResourceKey;
use converge_engine::Lifecycle;

/// Load a desired state from a JSON or TOML file, chosen by extension.
pub fn load_state(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_state(&content, path.extension().and_then(|e| e.to_str()))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn parse_state(content: &str, extension: Option<&str>) -> Result<Value> {
    let state: Value = match extension {
        Some("toml") => {
            let table: toml::Table = toml::from_str(content)?;
            serde_json::to_value(table)?
        }
        _ => serde_json::from_str(content)?,
    };
    if !state.is_object() {
        bail!("desired state must be an object");
    }
    Ok(state)
}

/// Apply `field=value` overrides to a key
pub fn override_key(mut key: ResourceKey, overrides: &[String]) -> Result<ResourceKey> {
    for entry in overrides {
        let (field, value) = entry
            .split_once('=')
            .filter(|(f, v)| !f.is_empty() && !v.is_empty())
            .ok_or_else(|| anyhow!("expected field=value, got {:?}", entry))?;
        if !key.identity.contains_key(field) {
            bail!("{} is not an identity field of {}", field, key.kind);
        }
        key = key.with(field, value);
    }
    Ok(key)
}

/// Parse a lifecycle directive such as `block-destruction`
pub fn parse_lifecycle(s: &str) -> Result<Lifecycle, String> {
    serde_json::from_value(Value::String(s.replace('-', "_")))
        .map_err(|_| format!("unknown lifecycle directive {:?}", s))
}
