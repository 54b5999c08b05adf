//! Built-in resource types

pub mod instance_group_manager;

use std::sync::Arc;

use converge_core::{Error, Result};

use crate::resource::ResourceType;

/// Kinds this crate ships a field table for
pub const BUILTIN_KINDS: &[&str] = &[instance_group_manager::KIND];

/// Look up a built-in resource type by kind
pub fn builtin(kind: &str) -> Result<Arc<ResourceType>> {
    match kind {
        instance_group_manager::KIND | "instance-group-manager" | "igm" => {
            Ok(Arc::new(instance_group_manager::resource_type()?))
        }
        other => Err(Error::invalid_input(format!(
            "unknown resource kind {:?} (known: {})",
            other,
            BUILTIN_KINDS.join(", ")
        ))),
    }
}
