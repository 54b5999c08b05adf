//! Remote management API consumed by the engine
//!
//! Implementations own transport, authentication, URL construction and
//! transport-level retries. They must be safe to share between concurrent
//! reconciliations: no per-call mutation of shared client state.

use async_trait::async_trait;
use serde_json::Value;

use converge_core::{AsyncHandle, JobStatus, OperationKind, Page, ResourceKey, Result, State, SubmitResponse};

#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Current remote representation. `Error::NotFound` when absent.
    async fn fetch(&self, key: &ResourceKey) -> Result<State>;

    /// One page of the resources under a parent scope.
    async fn list(&self, parent: &ResourceKey, page_token: Option<&str>, page_size: Option<u32>) -> Result<Page>;

    /// Issue a mutation. The body has already been built by the operation.
    async fn submit(&self, key: &ResourceKey, kind: &OperationKind, body: &Value) -> Result<SubmitResponse>;

    /// Progress of an asynchronous job.
    async fn poll(&self, handle: &AsyncHandle) -> Result<JobStatus>;
}
