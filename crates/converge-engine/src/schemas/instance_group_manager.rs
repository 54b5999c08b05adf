//! Managed instance group
//!
//! Field table for a zonal or regional instance group manager. Most mutable
//! fields are resolved by a single `patch`; target pools have their own
//! `setTargetPools` call. The distribution policy is fixed at creation
//! except for its target shape, which is patched. The `fingerprint` is the optimistic-concurrency
//! token echoed back on every update.

use std::sync::Arc;

use lazy_static::lazy_static;

use converge_core::{OperationSelector, Result};

use crate::resource::ResourceType;
use crate::schema::{FieldDescriptor, FieldKind, ObjectSchema, ScalarKind};

pub const KIND: &str = "compute.InstanceGroupManager";
pub const PATCH: &str = "patch";
pub const SET_TARGET_POOLS: &str = "setTargetPools";

lazy_static! {
    static ref FIXED_OR_PERCENT: Arc<ObjectSchema> = ObjectSchema::new("FixedOrPercent")
        .field(FieldDescriptor::nested("fixed", FieldKind::integer()))
        .field(FieldDescriptor::nested("percent", FieldKind::integer()))
        .field(FieldDescriptor::output_only("calculated", FieldKind::integer()))
        .into_shared();

    static ref VERSION: Arc<ObjectSchema> = ObjectSchema::new("Version")
        .field(FieldDescriptor::nested("name", FieldKind::string()))
        .field(FieldDescriptor::nested("instanceTemplate", FieldKind::reference()))
        .field(FieldDescriptor::nested("targetSize", FieldKind::object(&FIXED_OR_PERCENT)))
        .into_shared();

    static ref ZONE: Arc<ObjectSchema> = ObjectSchema::new("DistributionPolicyZone")
        .field(FieldDescriptor::nested("zone", FieldKind::reference()))
        .into_shared();

    static ref DISTRIBUTION_POLICY: Arc<ObjectSchema> = ObjectSchema::new("DistributionPolicy")
        .field(FieldDescriptor::nested("zones", FieldKind::object_list(&ZONE)))
        .field(FieldDescriptor::mutable(
            "targetShape",
            FieldKind::enumeration(),
            OperationSelector::triggers(PATCH),
        ))
        .into_shared();

    static ref AUTO_HEALING_POLICY: Arc<ObjectSchema> = ObjectSchema::new("AutoHealingPolicy")
        .field(FieldDescriptor::nested("healthCheck", FieldKind::reference()))
        .field(FieldDescriptor::nested("initialDelaySec", FieldKind::integer()))
        .into_shared();

    static ref UPDATE_POLICY: Arc<ObjectSchema> = ObjectSchema::new("UpdatePolicy")
        .field(FieldDescriptor::nested("type", FieldKind::enumeration()))
        .field(FieldDescriptor::nested("instanceRedistributionType", FieldKind::enumeration()))
        .field(FieldDescriptor::nested("minimalAction", FieldKind::enumeration()))
        .field(FieldDescriptor::nested("maxSurge", FieldKind::object(&FIXED_OR_PERCENT)))
        .field(FieldDescriptor::nested("maxUnavailable", FieldKind::object(&FIXED_OR_PERCENT)))
        .field(FieldDescriptor::nested("replacementMethod", FieldKind::enumeration()))
        .into_shared();

    static ref NAMED_PORT: Arc<ObjectSchema> = ObjectSchema::new("NamedPort")
        .field(FieldDescriptor::nested("name", FieldKind::string()))
        .field(FieldDescriptor::nested("port", FieldKind::integer()))
        .into_shared();

    static ref CURRENT_ACTIONS: Arc<ObjectSchema> = [
        "none",
        "creating",
        "creatingWithoutRetries",
        "verifying",
        "recreating",
        "deleting",
        "abandoning",
        "restarting",
        "refreshing",
    ]
    .iter()
    .fold(ObjectSchema::new("CurrentActions"), |schema, name| {
        schema.field(FieldDescriptor::output_only(name, FieldKind::integer()))
    })
    .into_shared();

    static ref VERSION_TARGET: Arc<ObjectSchema> = ObjectSchema::new("StatusVersionTarget")
        .field(FieldDescriptor::output_only("isReached", FieldKind::boolean()))
        .into_shared();

    static ref STATUS: Arc<ObjectSchema> = ObjectSchema::new("Status")
        .field(FieldDescriptor::output_only("isStable", FieldKind::boolean()))
        .field(FieldDescriptor::output_only("versionTarget", FieldKind::object(&VERSION_TARGET)))
        .field(FieldDescriptor::output_only("autoscaler", FieldKind::reference()))
        .into_shared();
}

/// Build the instance group manager resource type
pub fn resource_type() -> Result<ResourceType> {
    let patch = OperationSelector::triggers(PATCH);

    ResourceType::builder(KIND)
        .field(
            FieldDescriptor::identity("name", ScalarKind::String)
                .required()
                .describe("Name of the managed instance group"),
        )
        .field(FieldDescriptor::identity("project", ScalarKind::Reference))
        .field(
            FieldDescriptor::identity("location", ScalarKind::String)
                .describe("Zone or region"),
        )
        .field(FieldDescriptor::mutable(
            "description",
            FieldKind::string(),
            OperationSelector::RequiresRecreate,
        ))
        .field(
            FieldDescriptor::mutable(
                "distributionPolicy",
                FieldKind::object(&DISTRIBUTION_POLICY),
                OperationSelector::RequiresRecreate,
            )
            .server_default(),
        )
        .field(
            FieldDescriptor::mutable("instanceTemplate", FieldKind::reference(), patch.clone())
                .server_default()
                .describe("Template for every instance; conflicts with versions"),
        )
        .field(
            FieldDescriptor::mutable("versions", FieldKind::object_list(&VERSION), patch.clone())
                .server_default()
                .describe("Canary versions; conflicts with instanceTemplate"),
        )
        .field(FieldDescriptor::mutable(
            "targetPools",
            FieldKind::Set(ScalarKind::Reference),
            OperationSelector::triggers(SET_TARGET_POOLS),
        ))
        .field(
            FieldDescriptor::mutable("baseInstanceName", FieldKind::string(), patch.clone())
                .server_default(),
        )
        .field(
            FieldDescriptor::mutable("targetSize", FieldKind::integer(), patch.clone())
                .describe("Number of running instances"),
        )
        .field(FieldDescriptor::mutable(
            "autoHealingPolicies",
            FieldKind::object_list(&AUTO_HEALING_POLICY),
            patch.clone(),
        ))
        .field(
            FieldDescriptor::mutable("updatePolicy", FieldKind::object(&UPDATE_POLICY), patch)
                .server_default(),
        )
        .field(FieldDescriptor::mutable(
            "namedPorts",
            FieldKind::object_set(&NAMED_PORT),
            OperationSelector::RequiresRecreate,
        ))
        .field(FieldDescriptor::output_only("id", FieldKind::integer()))
        .field(FieldDescriptor::output_only("creationTimestamp", FieldKind::string()))
        .field(FieldDescriptor::output_only("instanceGroup", FieldKind::reference()))
        .field(FieldDescriptor::output_only("fingerprint", FieldKind::string()))
        .field(FieldDescriptor::output_only("currentActions", FieldKind::object(&CURRENT_ACTIONS)))
        .field(FieldDescriptor::output_only("status", FieldKind::object(&STATUS)))
        .field(FieldDescriptor::output_only("selfLink", FieldKind::string()))
        .parent_fields(&["project", "location"])
        .token_field("fingerprint")
        .exclusive(&["instanceTemplate", "versions"])
        .update_operation(PATCH)
        .update_operation(SET_TARGET_POOLS)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builds() {
        let rt = resource_type().unwrap();
        assert_eq!(rt.kind(), KIND);
        assert_eq!(rt.token_field(), Some("fingerprint"));
        assert_eq!(rt.registry().names(), vec![PATCH, SET_TARGET_POOLS]);
        assert_eq!(rt.identity_fields().count(), 3);
    }

    #[test]
    fn test_patch_body_carries_patch_fields_only() {
        let rt = resource_type().unwrap();
        let desired = json!({
            "name": "web",
            "project": "p",
            "location": "us-central1-a",
            "targetSize": 3,
            "targetPools": ["pool-a"],
            "description": "frontends",
        });
        let body = rt.update_body(PATCH, &desired, &[]);
        assert_eq!(body["targetSize"], 3);
        assert!(body.get("targetPools").is_none());
        assert!(body.get("description").is_none());

        let pools = rt.update_body(SET_TARGET_POOLS, &desired, &[]);
        assert_eq!(pools["targetPools"], json!(["pool-a"]));
        assert!(pools.get("targetSize").is_none());
    }

    #[test]
    fn test_output_only_status_never_diffs() {
        let rt = resource_type().unwrap();
        let desired = json!({"name": "web", "project": "p", "location": "z", "targetSize": 2});
        let actual = json!({
            "name": "web",
            "project": "p",
            "location": "z",
            "targetSize": 2,
            "status": {"isStable": false, "versionTarget": {"isReached": false}},
            "currentActions": {"creating": 2},
            "fingerprint": "abc",
        });
        let diffs = rt.diff(Some(&desired), Some(&actual)).unwrap();
        assert!(crate::diff::actionable(&diffs).is_empty());
    }

    #[test]
    fn test_target_shape_is_patched_not_recreated() {
        let rt = resource_type().unwrap();
        let policy = json!({"zones": [{"zone": "zones/us-central1-a"}], "targetShape": "EVEN"});
        let actual = json!({"name": "web", "project": "p", "location": "us-central1", "distributionPolicy": policy});
        let mut desired = actual.clone();
        desired["distributionPolicy"]["targetShape"] = json!("BALANCED");

        let diffs = rt.diff(Some(&desired), Some(&actual)).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "distributionPolicy.targetShape");
        assert_eq!(diffs[0].selector, OperationSelector::triggers(PATCH));

        let body = rt.update_body(PATCH, &desired, &diffs);
        assert_eq!(body["distributionPolicy"]["targetShape"], "BALANCED");

        desired["distributionPolicy"]["zones"] = json!([{"zone": "zones/us-central1-b"}]);
        let diffs = rt.diff(Some(&desired), Some(&actual)).unwrap();
        assert!(diffs
            .iter()
            .any(|d| d.path == "distributionPolicy.zones" && d.selector == OperationSelector::RequiresRecreate));
    }
}
