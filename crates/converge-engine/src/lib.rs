//! converge-engine: declarative convergence of remote resources
//!
//! Provides:
//! - Field tables describing resource types (schema, resource)
//! - Canonicalization and field-level diffing
//! - Classification of differences into recreate or named updates
//! - Operation execution with async job polling and cancellation
//! - The reconciliation driver, listing and identity matching
//! - An in-memory API for dry runs and tests
//! - Built-in resource types

pub mod api;
pub mod canonical;
pub mod classify;
pub mod diff;
pub mod matcher;
pub mod memory;
pub mod operation;
pub mod policy;
pub mod reconciler;
pub mod registry;
pub mod resource;
pub mod run;
pub mod schema;
pub mod schemas;
pub mod value;

pub use api::ResourceApi;
pub use classify::{classify, Classification, PlannedOperation};
pub use memory::{MemoryApi, MemoryApiConfig, Submission};
pub use operation::{
    ApiOperation, CreateOperation, DeleteOperation, OperationContext, UpdateOperation,
};
pub use policy::{Lifecycle, LifecycleSet, ReconcilePolicy};
pub use reconciler::{Action, DeleteAllReport, Plan, ReconcileOutcome, Reconciler};
pub use registry::OperationRegistry;
pub use resource::{ResourceType, ResourceTypeBuilder};
pub use run::{Phase, ReconcileRun};
pub use schema::{FieldDescriptor, FieldKind, FieldRole, NestedType, ObjectSchema, ScalarKind};

// Re-export core types
pub use converge_core::{
    AsyncHandle, EngineConfig, Error, FieldDiff, JobStatus, OperationKind, OperationSelector,
    Page, ResourceKey, Result, State, SubmitResponse, RECREATE,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::api::ResourceApi;
    pub use super::policy::{Lifecycle, ReconcilePolicy};
    pub use super::reconciler::{Action, Reconciler};
    pub use super::resource::ResourceType;
    pub use super::schema::{FieldDescriptor, FieldKind, ObjectSchema, ScalarKind};
    pub use converge_core::{Error, OperationSelector, ResourceKey, Result, State};
    pub use tokio_util::sync::CancellationToken;
}
