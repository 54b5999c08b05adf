//! Identity matching of listed records

use serde_json::Value;

use crate::canonical::scalar_equivalent;
use crate::resource::ResourceType;
use crate::schema::{FieldKind, ScalarKind};

/// Whether `candidate` denotes the same resource as `desired`.
///
/// Only identity fields are compared. Null on both sides is equal, null on
/// one side is not; values compare with the canonicalizer's equivalence, so
/// references match by short name and enums ignore case.
pub fn matches(resource_type: &ResourceType, candidate: &Value, desired: &Value) -> bool {
    resource_type.identity_fields().all(|field| {
        let c = candidate.get(&field.name).filter(|v| !v.is_null());
        let d = desired.get(&field.name).filter(|v| !v.is_null());
        match (c, d) {
            (None, None) => true,
            (Some(c), Some(d)) => {
                let kind = match field.kind {
                    FieldKind::Scalar(kind) => kind,
                    _ => ScalarKind::String,
                };
                scalar_equivalent(kind, c, d)
            }
            _ => false,
        }
    })
}
