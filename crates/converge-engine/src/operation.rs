//! Executable remote operations
//!
//! Operations are the only part of the engine that mutates remote state.
//! Each one re-fetches what it needs, builds its own request body, submits
//! it and, when the API answers with a job handle, polls the job to a
//! terminal status.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use converge_core::{
    AsyncHandle, Error, FieldDiff, JobStatus, OperationKind, ResourceKey, Result, State, SubmitResponse,
};

use crate::api::ResourceApi;
use crate::policy::ReconcilePolicy;
use crate::resource::ResourceType;

/// Everything an operation may use while it runs
pub struct OperationContext<'a> {
    pub api: &'a dyn ResourceApi,
    pub resource_type: &'a ResourceType,
    pub key: &'a ResourceKey,
    pub policy: &'a ReconcilePolicy,
    pub cancel: &'a CancellationToken,
    /// Differences this operation was planned for
    pub diffs: &'a [FieldDiff],
}

impl OperationContext<'_> {
    /// Fetch the resource, honouring cancellation.
    pub async fn fetch(&self) -> Result<State> {
        cancellable(self.cancel, self.api.fetch(self.key)).await
    }

    /// Submit a mutation and wait for it if the API runs it as a job.
    /// Returns the resource body the API reported, if any.
    pub async fn submit(&self, kind: &OperationKind, body: &Value) -> Result<Option<State>> {
        debug!(resource = %self.key, operation = %kind, "Submitting request: {}", body);
        let response = cancellable(self.cancel, self.api.submit(self.key, kind, body)).await?;
        match response {
            SubmitResponse::Completed { resource } => Ok(resource),
            SubmitResponse::Pending { handle } => {
                wait_for_job(self.api, &handle, self.policy, self.cancel).await
            }
        }
    }
}

/// Race a network call against the cancellation signal
pub async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled { handle: None }),
        result = call => result,
    }
}

/// Poll an async job until it is done, failed, out of budget or cancelled.
///
/// The delay between polls starts at `poll_interval` and doubles up to
/// `poll_backoff_max`. A timeout or cancellation leaves the remote job
/// running and reports its handle.
pub async fn wait_for_job(
    api: &dyn ResourceApi,
    handle: &AsyncHandle,
    policy: &ReconcilePolicy,
    cancel: &CancellationToken,
) -> Result<Option<State>> {
    let start = Instant::now();
    let mut delay = policy.poll_interval;

    loop {
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { handle: Some(handle.clone()) });
            }
            status = api.poll(handle) => status?,
        };

        match status {
            JobStatus::Done { resource } => {
                debug!(operation = %handle, elapsed = ?start.elapsed(), "Operation done");
                return Ok(resource);
            }
            JobStatus::Failed { message } => {
                return Err(Error::OperationFailed {
                    handle: handle.clone(),
                    message,
                });
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.operation_timeout {
            return Err(Error::Timeout {
                handle: handle.clone(),
                elapsed,
            });
        }

        let remaining = policy.operation_timeout - elapsed;
        debug!(operation = %handle, ?delay, "Operation still running");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { handle: Some(handle.clone()) });
            }
            _ = tokio::time::sleep(delay.min(remaining)) => {}
        }
        delay = (delay * 2).min(policy.poll_backoff_max);
    }
}

/// A remote action the engine can run against one resource
#[async_trait]
pub trait ApiOperation: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Run the operation with `desired` as the canonical desired state.
    /// Returns the resource body reported by the API, if any.
    async fn execute(&self, desired: &State, ctx: &OperationContext<'_>) -> Result<Option<State>>;
}

/// Creates the resource from the full desired state
#[derive(Debug, Default, Clone)]
pub struct CreateOperation;

#[async_trait]
impl ApiOperation for CreateOperation {
    fn name(&self) -> &str {
        "create"
    }

    async fn execute(&self, desired: &State, ctx: &OperationContext<'_>) -> Result<Option<State>> {
        let body = ctx.resource_type.expand(desired);
        info!(resource = %ctx.key, "Creating resource");
        ctx.submit(&OperationKind::Create, &body).await
    }
}

/// Named in-place update carrying only the fields routed to it plus the
/// concurrency token read just before submitting
#[derive(Debug, Clone)]
pub struct UpdateOperation {
    name: String,
}

impl UpdateOperation {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ApiOperation for UpdateOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, desired: &State, ctx: &OperationContext<'_>) -> Result<Option<State>> {
        let current = ctx.fetch().await?;
        let mut body = ctx.resource_type.update_body(&self.name, desired, ctx.diffs);

        let token = ctx.resource_type.token(&current);
        if let (Some(field), Some(token)) = (ctx.resource_type.token_field(), &token) {
            body[field] = Value::String(token.clone());
        }

        info!(
            resource = %ctx.key,
            operation = %self.name,
            fields = ctx.diffs.len(),
            "Updating resource"
        );
        ctx.submit(&OperationKind::Update(self.name.clone()), &body)
            .await
            .map_err(|err| match err {
                Error::Conflict { message, token: None } => Error::Conflict { message, token },
                other => other,
            })
    }
}

/// Deletes the resource and waits until reads stop returning it
#[derive(Debug, Default, Clone)]
pub struct DeleteOperation;

#[async_trait]
impl ApiOperation for DeleteOperation {
    fn name(&self) -> &str {
        "delete"
    }

    async fn execute(&self, _desired: &State, ctx: &OperationContext<'_>) -> Result<Option<State>> {
        match ctx.fetch().await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!(resource = %ctx.key, "Resource already absent, nothing to delete");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        info!(resource = %ctx.key, "Deleting resource");
        ctx.submit(&OperationKind::Delete, &Value::Object(Default::default()))
            .await?;

        // Reads may lag behind the delete
        for attempt in 1..=ctx.policy.delete_confirm_attempts {
            match ctx.fetch().await {
                Err(e) if e.is_not_found() => {
                    debug!(resource = %ctx.key, attempt, "Delete confirmed");
                    return Ok(None);
                }
                Err(e) => return Err(e),
                Ok(_) => {
                    warn!(
                        resource = %ctx.key,
                        attempt,
                        max = ctx.policy.delete_confirm_attempts,
                        "Resource still visible after delete"
                    );
                    if attempt < ctx.policy.delete_confirm_attempts {
                        cancellable(ctx.cancel, async {
                            tokio::time::sleep(ctx.policy.delete_confirm_backoff).await;
                            Ok(())
                        })
                        .await?;
                    }
                }
            }
        }

        Err(Error::NotDeleted(ctx.key.to_string()))
    }
}
